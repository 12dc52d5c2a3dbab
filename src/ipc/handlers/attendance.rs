use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::calendar;
use crate::db;
use crate::ipc::helpers::{
    now_iso, optional_i64, optional_str, require_actor, require_student, required_array,
    required_date, required_i64, required_status, today, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Actor, AttendanceStatus, Role};

/// Outcome of applying one mark. CONFLICT means the caller's expected version
/// was stale; nothing was written for that item.
pub enum MarkOutcome {
    Applied { record_id: i64, version: i64 },
    Unchanged { record_id: i64, version: i64 },
    Conflict { record_id: i64, current_version: i64 },
}

/// Enforce the mutation window: non-admins may only touch dates at most
/// `edit_window_days` in the past. Future dates are always inside the window.
pub fn check_edit_window(
    conn: &Connection,
    date: NaiveDate,
    actor: Actor,
) -> Result<(), HandlerErr> {
    let window = db::edit_window_days(conn)?;
    let days_diff = (today() - date).num_days();
    if days_diff > window && actor.role != Role::Admin {
        return Err(HandlerErr::new(
            "edit_window_expired",
            format!(
                "Edit window expired; contact admin. You can only edit for the past {} days.",
                window
            ),
        ));
    }
    Ok(())
}

/// Upsert one attendance record and append its audit row. This is the single
/// write path for attendance status: manual marking and leave approval both
/// come through here, so the audit trail is uniform.
///
/// Re-submitting the current status is a no-op: no audit row, no version
/// bump. An `expected_version` of 0 asserts the record does not exist yet.
pub fn apply_mark(
    conn: &Connection,
    enrollment_id: i64,
    date: &str,
    period_index: i64,
    status: AttendanceStatus,
    expected_version: Option<i64>,
    changed_by: i64,
    changed_at: &str,
) -> Result<MarkOutcome, HandlerErr> {
    let existing: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT id, status, version FROM attendance_records
             WHERE enrollment_id = ? AND date = ? AND period_index = ?",
            (enrollment_id, date, period_index),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    match existing {
        Some((record_id, old_status, version)) => {
            if let Some(expected) = expected_version {
                if expected != version {
                    return Ok(MarkOutcome::Conflict {
                        record_id,
                        current_version: version,
                    });
                }
            }
            if old_status == status.as_str() {
                return Ok(MarkOutcome::Unchanged { record_id, version });
            }
            conn.execute(
                "UPDATE attendance_records
                 SET status = ?, marked_by = ?, marked_at = ?, version = version + 1
                 WHERE id = ?",
                (status.as_str(), changed_by, changed_at, record_id),
            )
            .map_err(HandlerErr::db_update)?;
            conn.execute(
                "INSERT INTO attendance_audits(record_id, old_status, new_status, changed_by, changed_at)
                 VALUES(?, ?, ?, ?, ?)",
                (record_id, &old_status, status.as_str(), changed_by, changed_at),
            )
            .map_err(HandlerErr::db_update)?;
            Ok(MarkOutcome::Applied {
                record_id,
                version: version + 1,
            })
        }
        None => {
            if let Some(expected) = expected_version {
                if expected != 0 {
                    return Ok(MarkOutcome::Conflict {
                        record_id: -1,
                        current_version: 0,
                    });
                }
            }
            conn.execute(
                "INSERT INTO attendance_records(enrollment_id, date, period_index, status, marked_by, marked_at, version)
                 VALUES(?, ?, ?, ?, ?, ?, 1)",
                (enrollment_id, date, period_index, status.as_str(), changed_by, changed_at),
            )
            .map_err(HandlerErr::db_update)?;
            let record_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO attendance_audits(record_id, old_status, new_status, changed_by, changed_at)
                 VALUES(?, NULL, ?, ?, ?)",
                (record_id, status.as_str(), changed_by, changed_at),
            )
            .map_err(HandlerErr::db_update)?;
            Ok(MarkOutcome::Applied {
                record_id,
                version: 1,
            })
        }
    }
}

fn round_percent(numerator: i64, denominator: i64) -> i64 {
    if denominator <= 0 {
        return 100;
    }
    ((numerator as f64 / denominator as f64) * 100.0).round() as i64
}

fn section_students(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_actor(req)?;
    let section_id = required_i64(&req.params, "sectionId")?;
    let date = required_date(&req.params, "date")?.format("%Y-%m-%d").to_string();
    let period_index = required_i64(&req.params, "periodIndex")?;

    let mut stmt = conn.prepare(
        "SELECT e.id, u.id, u.name, u.college_id,
            (SELECT COUNT(*) FROM attendance_records r WHERE r.enrollment_id = e.id),
            (SELECT COUNT(*) FROM attendance_records r WHERE r.enrollment_id = e.id AND r.status != 'ABSENT'),
            (SELECT r.status FROM attendance_records r
              WHERE r.enrollment_id = e.id AND r.date = ?2 AND r.period_index = ?3)
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.section_id = ?1
         ORDER BY u.name",
    )?;
    let students = stmt
        .query_map((section_id, &date, period_index), |r| {
            let total: i64 = r.get(4)?;
            let attended: i64 = r.get(5)?;
            let status: Option<String> = r.get(6)?;
            Ok(json!({
                "enrollmentId": r.get::<_, i64>(0)?,
                "studentId": r.get::<_, i64>(1)?,
                "name": r.get::<_, String>(2)?,
                "collegeId": r.get::<_, String>(3)?,
                "attendancePercentage": round_percent(attended, total),
                "status": status,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn bulk_mark(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(req)?;
    let date = required_date(&req.params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();
    let period_index = required_i64(&req.params, "periodIndex")?;
    let items = required_array(&req.params, "items")?;

    check_edit_window(conn, date, actor)?;

    let changed_at = now_iso();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let enrollment_id = required_i64(item, "enrollmentId")?;
        let status = required_status(item, "status")?;
        let expected_version = optional_i64(item, "expectedVersion");
        let local_id = optional_str(item, "localId");

        let outcome = apply_mark(
            &tx,
            enrollment_id,
            &date_str,
            period_index,
            status,
            expected_version,
            actor.id,
            &changed_at,
        )?;
        let mut ack = match outcome {
            MarkOutcome::Applied { record_id, version } => json!({
                "enrollmentId": enrollment_id,
                "status": "APPLIED",
                "recordId": record_id,
                "version": version,
            }),
            MarkOutcome::Unchanged { record_id, version } => json!({
                "enrollmentId": enrollment_id,
                "status": "UNCHANGED",
                "recordId": record_id,
                "version": version,
            }),
            MarkOutcome::Conflict {
                record_id,
                current_version,
            } => json!({
                "enrollmentId": enrollment_id,
                "status": "CONFLICT",
                "recordId": record_id,
                "currentVersion": current_version,
            }),
        };
        if let Some(local) = local_id {
            ack["localId"] = json!(local);
        }
        results.push(ack);
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "results": results }))
}

/// A period counts as missed only when no enrolled student of that section
/// has any record for the date; partial marking means the grid was opened.
fn missed(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(req)?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(actor.id);
    let window = db::edit_window_days(conn)?;

    let mut holiday_stmt = conn.prepare("SELECT date FROM holidays WHERE lecturer_id = ?")?;
    let holidays: std::collections::HashSet<String> = holiday_stmt
        .query_map([lecturer_id], |r| r.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    let mut period_stmt = conn.prepare(
        "SELECT t.id, t.section_id, t.period_index, t.day_of_week, t.start_time, t.end_time,
                c.title, c.code, s.section_name
         FROM timetable_entries t
         JOIN sections s ON s.id = t.section_id
         JOIN courses c ON c.id = s.course_id
         WHERE t.lecturer_id = ? AND t.day_of_week = ?
         ORDER BY t.period_index",
    )?;

    let today = today();
    let mut missed = Vec::new();
    for days_back in 1..=window {
        let check_date = today - chrono::Duration::days(days_back);
        let date_str = check_date.format("%Y-%m-%d").to_string();
        if holidays.contains(&date_str) {
            continue;
        }
        let dow = calendar::day_of_week(check_date) as i64;

        let periods = period_stmt
            .query_map((lecturer_id, dow), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (entry_id, section_id, period_index, day_of_week, start, end, title, code, section_name) in
            periods
        {
            let enrolled: i64 = conn.query_row(
                "SELECT COUNT(*) FROM enrollments WHERE section_id = ?",
                [section_id],
                |r| r.get(0),
            )?;
            if enrolled == 0 {
                continue;
            }
            let has_records: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM attendance_records r
                     JOIN enrollments e ON e.id = r.enrollment_id
                     WHERE e.section_id = ? AND r.date = ? AND r.period_index = ?
                     LIMIT 1",
                    (section_id, &date_str, period_index),
                    |r| r.get(0),
                )
                .optional()?;
            if has_records.is_none() {
                missed.push((
                    date_str.clone(),
                    period_index,
                    json!({
                        "date": date_str,
                        "period": {
                            "id": entry_id,
                            "sectionId": section_id,
                            "lecturerId": lecturer_id,
                            "dayOfWeek": day_of_week,
                            "periodIndex": period_index,
                            "startTime": start,
                            "endTime": end,
                            "course": { "title": title, "code": code },
                            "sectionName": section_name,
                        }
                    }),
                ));
            }
        }
    }

    missed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    let missed: Vec<serde_json::Value> = missed.into_iter().map(|(_, _, v)| v).collect();
    Ok(json!({ "missed": missed }))
}

/// Null result means "not marked yet"; no default status is synthesized.
fn student_details(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_actor(req)?;
    let student_id = required_i64(&req.params, "studentId")?;
    let course_id = required_i64(&req.params, "courseId")?;
    let section_id = required_i64(&req.params, "sectionId")?;
    let date = required_date(&req.params, "date")?.format("%Y-%m-%d").to_string();
    let period_index = required_i64(&req.params, "periodIndex")?;

    let enrollment_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND course_id = ? AND section_id = ?",
            (student_id, course_id, section_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(enrollment_id) = enrollment_id else {
        return Ok(serde_json::Value::Null);
    };

    let record: Option<(i64, String, i64, String)> = conn
        .query_row(
            "SELECT id, status, marked_by, marked_at FROM attendance_records
             WHERE enrollment_id = ? AND date = ? AND period_index = ?",
            (enrollment_id, &date, period_index),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((record_id, status, marked_by, marked_at)) = record else {
        return Ok(serde_json::Value::Null);
    };

    let marker: Option<String> = conn
        .query_row("SELECT name FROM users WHERE id = ?", [marked_by], |r| {
            r.get(0)
        })
        .optional()?;

    // History is always reconstructed from the append-only audit log.
    let mut audit_stmt = conn.prepare(
        "SELECT a.old_status, a.new_status, u.name, a.changed_at
         FROM attendance_audits a
         LEFT JOIN users u ON u.id = a.changed_by
         WHERE a.record_id = ?
         ORDER BY a.changed_at DESC, a.id DESC",
    )?;
    let history = audit_stmt
        .query_map([record_id], |r| {
            Ok(json!({
                "oldStatus": r.get::<_, Option<String>>(0)?,
                "newStatus": r.get::<_, String>(1)?,
                "changedBy": r.get::<_, Option<String>>(2)?.unwrap_or_else(|| "Unknown".to_string()),
                "changedAt": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "status": status,
        "markedBy": marker.unwrap_or_else(|| "Unknown".to_string()),
        "markedAt": marked_at,
        "history": history,
    }))
}

fn student_history(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);
    let course_id = required_i64(&req.params, "courseId")?;
    let section_id = required_i64(&req.params, "sectionId")?;

    let enrollment_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND course_id = ? AND section_id = ?",
            (student_id, course_id, section_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(enrollment_id) = enrollment_id else {
        return Ok(json!({ "history": [] }));
    };

    let mut stmt = conn.prepare(
        "SELECT date, period_index, status FROM attendance_records
         WHERE enrollment_id = ?
         ORDER BY date DESC, period_index ASC",
    )?;
    let history = stmt
        .query_map([enrollment_id], |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "periodIndex": r.get::<_, i64>(1)?,
                "status": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "history": history }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.sectionStudents" => Some(with_db(state, req, section_students)),
        "attendance.bulkMark" => Some(with_db(state, req, bulk_mark)),
        "attendance.missed" => Some(with_db(state, req, missed)),
        "attendance.studentDetails" => Some(with_db(state, req, student_details)),
        "attendance.studentHistory" => Some(with_db(state, req, student_history)),
        _ => None,
    }
}
