use chrono::Duration;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::calendar;
use crate::ipc::handlers::attendance::{apply_mark, check_edit_window};
use crate::ipc::helpers::{
    now_iso, optional_i64, require_lecturer, require_student, required_date, required_i64,
    required_str, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{AttendanceStatus, LeaveStatus};

fn leave_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "groupId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, i64>(2)?,
        "courseId": r.get::<_, i64>(3)?,
        "sectionId": r.get::<_, i64>(4)?,
        "date": r.get::<_, String>(5)?,
        "periodIndex": r.get::<_, i64>(6)?,
        "reason": r.get::<_, String>(7)?,
        "status": r.get::<_, String>(8)?,
        "reviewedBy": r.get::<_, Option<i64>>(9)?,
        "reviewedAt": r.get::<_, Option<String>>(10)?,
        "requestStartDate": r.get::<_, Option<String>>(11)?,
        "requestEndDate": r.get::<_, Option<String>>(12)?,
    }))
}

const LEAVE_SELECT: &str = "SELECT id, group_id, student_id, course_id, section_id, date,
        period_index, reason, status, reviewed_by, reviewed_at,
        request_start_date, request_end_date
 FROM leave_requests";

fn create_single(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let course_id = required_i64(&req.params, "courseId")?;
    let section_id = required_i64(&req.params, "sectionId")?;
    let date = required_date(&req.params, "date")?.format("%Y-%m-%d").to_string();
    let period_index = required_i64(&req.params, "periodIndex")?;
    let reason = required_str(&req.params, "reason")?;

    let group_id = format!("single-{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO leave_requests(group_id, student_id, course_id, section_id, date,
            period_index, reason, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'PENDING')",
        (&group_id, actor.id, course_id, section_id, &date, period_index, &reason),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({
        "id": conn.last_insert_rowid(),
        "groupId": group_id,
        "status": LeaveStatus::Pending.as_str(),
    }))
}

/// Expand an inclusive date range into one request row per scheduled period
/// in the student's own timetable. Holidays are not filtered here: a holiday
/// date simply matches no periods worth excusing later.
fn create_bulk(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);
    let start = required_date(&req.params, "startDate")?;
    let end = required_date(&req.params, "endDate")?;
    let reason = required_str(&req.params, "reason")?;

    let mut timetable_stmt = conn.prepare(
        "SELECT t.section_id, t.day_of_week, t.period_index, s.course_id
         FROM timetable_entries t
         JOIN sections s ON s.id = t.section_id
         WHERE t.section_id IN (SELECT section_id FROM enrollments WHERE student_id = ?)
         ORDER BY t.period_index",
    )?;
    let periods = timetable_stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let group_id = format!("bulk-{}", Uuid::new_v4());
    let start_str = start.format("%Y-%m-%d").to_string();
    let end_str = end.format("%Y-%m-%d").to_string();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut created = 0usize;
    let mut d = start;
    while d <= end {
        let date_str = d.format("%Y-%m-%d").to_string();
        let dow = calendar::day_of_week(d) as i64;
        for (section_id, day_of_week, period_index, course_id) in &periods {
            if *day_of_week != dow {
                continue;
            }
            tx.execute(
                "INSERT INTO leave_requests(group_id, student_id, course_id, section_id, date,
                    period_index, reason, status, request_start_date, request_end_date)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)",
                (
                    &group_id, student_id, course_id, section_id, &date_str, period_index,
                    &reason, &start_str, &end_str,
                ),
            )
            .map_err(HandlerErr::db_update)?;
            created += 1;
        }
        d += Duration::days(1);
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "groupId": group_id, "created": created }))
}

fn list_for_student(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);
    let sql = format!("{} WHERE student_id = ? ORDER BY id", LEAVE_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let requests = stmt
        .query_map([student_id], leave_row_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "requests": requests }))
}

struct LecturerLeaveRow {
    group_id: String,
    student_id: i64,
    course_title: String,
    date: String,
    reason: String,
    status: String,
    reviewed_by: Option<i64>,
    reviewed_at: Option<String>,
    request_start_date: Option<String>,
    request_end_date: Option<String>,
}

/// Group this lecturer's slice of each request group. Status, course titles
/// and period count all describe the lecturer's own rows only; other
/// lecturers' rows in the same group are invisible here.
fn consolidated_for_lecturer(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer(req)?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(actor.id);

    let mut stmt = conn.prepare(
        "SELECT l.group_id, l.student_id, c.title, l.date, l.reason, l.status,
                l.reviewed_by, l.reviewed_at, l.request_start_date, l.request_end_date
         FROM leave_requests l
         JOIN courses c ON c.id = l.course_id
         WHERE l.section_id IN
           (SELECT DISTINCT section_id FROM timetable_entries WHERE lecturer_id = ?)
         ORDER BY l.id",
    )?;
    let rows = stmt
        .query_map([lecturer_id], |r| {
            Ok(LecturerLeaveRow {
                group_id: r.get(0)?,
                student_id: r.get(1)?,
                course_title: r.get(2)?,
                date: r.get(3)?,
                reason: r.get(4)?,
                status: r.get(5)?,
                reviewed_by: r.get(6)?,
                reviewed_at: r.get(7)?,
                request_start_date: r.get(8)?,
                request_end_date: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<LecturerLeaveRow>> = HashMap::new();
    for row in rows {
        if !groups.contains_key(&row.group_id) {
            order.push(row.group_id.clone());
        }
        groups.entry(row.group_id.clone()).or_default().push(row);
    }

    let mut consolidated = Vec::with_capacity(order.len());
    for group_id in order {
        let group_rows = &groups[&group_id];
        let first = &group_rows[0];

        let student: Option<(String, String)> = conn
            .query_row(
                "SELECT name, college_id FROM users WHERE id = ?",
                [first.student_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let reviewer_name: Option<String> = match first.reviewed_by {
            Some(id) => conn
                .query_row("SELECT name FROM users WHERE id = ?", [id], |r| r.get(0))
                .optional()?,
            None => None,
        };

        let mut course_titles: Vec<String> = Vec::new();
        for row in group_rows {
            if !course_titles.contains(&row.course_title) {
                course_titles.push(row.course_title.clone());
            }
        }

        let start_date = first
            .request_start_date
            .clone()
            .unwrap_or_else(|| first.date.clone());
        let end_date = first
            .request_end_date
            .clone()
            .unwrap_or_else(|| first.date.clone());

        consolidated.push(json!({
            "groupId": group_id,
            "student": student.map(|(name, college_id)| json!({
                "id": first.student_id,
                "name": name,
                "collegeId": college_id,
            })),
            "reason": first.reason,
            "startDate": start_date,
            "endDate": end_date,
            "status": first.status,
            "courseTitles": course_titles,
            "periodCount": group_rows.len(),
            "reviewedByName": reviewer_name,
            "reviewedAt": first.reviewed_at,
        }));
    }

    consolidated.sort_by(|a, b| {
        let sa = a["startDate"].as_str().unwrap_or("");
        let sb = b["startDate"].as_str().unwrap_or("");
        sb.cmp(sa)
    });
    Ok(json!({ "requests": consolidated }))
}

fn pending_count(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer(req)?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(actor.id);
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT group_id) FROM leave_requests
         WHERE status = 'PENDING' AND section_id IN
           (SELECT DISTINCT section_id FROM timetable_entries WHERE lecturer_id = ?)",
        [lecturer_id],
        |r| r.get(0),
    )?;
    Ok(json!({ "pending": count }))
}

/// Review only the group rows owned by the calling lecturer. Approval also
/// excuses the student for each covered period through the standard mark
/// path, so the audit trail matches a manual mark exactly.
fn review_group(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer(req)?;
    let group_id = required_str(&req.params, "groupId")?;
    let status_raw = required_str(&req.params, "status")?;
    let status = LeaveStatus::parse(&status_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("invalid status \"{}\"", status_raw)))?;
    if status == LeaveStatus::Pending {
        return Err(HandlerErr::bad_params(
            "review status must be APPROVED or DENIED",
        ));
    }

    let mut stmt = conn.prepare(
        "SELECT id, student_id, section_id, date, period_index FROM leave_requests
         WHERE group_id = ? AND section_id IN
           (SELECT DISTINCT section_id FROM timetable_entries WHERE lecturer_id = ?)
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map((&group_id, actor.id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        // Another lecturer may own every row in this group; nothing to do.
        tracing::warn!(
            lecturer_id = actor.id,
            group_id = %group_id,
            "review requested for a group with no matching sections"
        );
        return Ok(json!({ "updated": 0 }));
    }

    let now = now_iso();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    for (request_id, student_id, section_id, date, period_index) in &rows {
        tx.execute(
            "UPDATE leave_requests SET status = ?, reviewed_by = ?, reviewed_at = ? WHERE id = ?",
            (status.as_str(), actor.id, &now, request_id),
        )
        .map_err(HandlerErr::db_update)?;

        if status == LeaveStatus::Approved {
            let enrollment_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM enrollments WHERE student_id = ? AND section_id = ?",
                    (student_id, section_id),
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(enrollment_id) = enrollment_id {
                let leave_date = calendar::parse_date(date)
                    .ok_or_else(|| HandlerErr::bad_params("stored leave date is invalid"))?;
                check_edit_window(&tx, leave_date, actor)?;
                apply_mark(
                    &tx,
                    enrollment_id,
                    date,
                    *period_index,
                    AttendanceStatus::Excused,
                    None,
                    actor.id,
                    &now,
                )?;
            }
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "updated": rows.len() }))
}

/// Student-side consolidation: one entry per (course, lecturer) pair in the
/// group, with an aggregate status that collapses to PARTIAL on any mix.
fn consolidated_for_student(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);

    let mut stmt = conn.prepare(
        "SELECT group_id, section_id, date, reason, status,
                request_start_date, request_end_date
         FROM leave_requests WHERE student_id = ? ORDER BY id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(i64, String, String, String, Option<String>, Option<String>)>> =
        HashMap::new();
    for (group_id, section_id, date, reason, status, start, end) in rows {
        if !groups.contains_key(&group_id) {
            order.push(group_id.clone());
        }
        groups
            .entry(group_id)
            .or_default()
            .push((section_id, date, reason, status, start, end));
    }

    let mut consolidated = Vec::with_capacity(order.len());
    for group_id in order {
        let group_rows = &groups[&group_id];
        let first = &group_rows[0];

        let mut details = Vec::new();
        let mut seen_pairs: HashSet<(i64, i64)> = HashSet::new();
        let mut statuses: HashSet<String> = HashSet::new();
        for (section_id, date, _, status, _, _) in group_rows {
            let Some(leave_date) = calendar::parse_date(date) else {
                continue;
            };
            let dow = calendar::day_of_week(leave_date) as i64;
            let entry: Option<(i64, i64, String)> = conn
                .query_row(
                    "SELECT t.lecturer_id, c.id, c.title
                     FROM timetable_entries t
                     JOIN sections s ON s.id = t.section_id
                     JOIN courses c ON c.id = s.course_id
                     WHERE t.section_id = ? AND t.day_of_week = ?
                     ORDER BY t.period_index LIMIT 1",
                    (section_id, dow),
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((lecturer_id, course_id, course_title)) = entry else {
                continue;
            };
            if !seen_pairs.insert((course_id, lecturer_id)) {
                continue;
            }
            let lecturer_name: Option<String> = conn
                .query_row("SELECT name FROM users WHERE id = ?", [lecturer_id], |r| {
                    r.get(0)
                })
                .optional()?;

            statuses.insert(status.clone());
            details.push(json!({
                "courseTitle": course_title,
                "lecturerName": lecturer_name.unwrap_or_else(|| "Unknown".to_string()),
                "status": status,
            }));
        }

        let overall_status = if statuses.len() == 1 {
            statuses.iter().next().cloned().unwrap_or_else(|| "PENDING".to_string())
        } else if statuses.is_empty() {
            "PENDING".to_string()
        } else {
            "PARTIAL".to_string()
        };

        consolidated.push(json!({
            "groupId": group_id,
            "reason": first.2,
            "startDate": first.4.clone().unwrap_or_else(|| first.1.clone()),
            "endDate": first.5.clone().unwrap_or_else(|| first.1.clone()),
            "details": details,
            "overallStatus": overall_status,
        }));
    }

    consolidated.sort_by(|a, b| {
        let sa = a["startDate"].as_str().unwrap_or("");
        let sb = b["startDate"].as_str().unwrap_or("");
        sb.cmp(sa)
    });
    Ok(json!({ "requests": consolidated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "leave.create" => Some(with_db(state, req, create_single)),
        "leave.createBulk" => Some(with_db(state, req, create_bulk)),
        "leave.listForStudent" => Some(with_db(state, req, list_for_student)),
        "leave.consolidatedForLecturer" => Some(with_db(state, req, consolidated_for_lecturer)),
        "leave.pendingCount" => Some(with_db(state, req, pending_count)),
        "leave.reviewGroup" => Some(with_db(state, req, review_group)),
        "leave.consolidatedForStudent" => Some(with_db(state, req, consolidated_for_student)),
        _ => None,
    }
}
