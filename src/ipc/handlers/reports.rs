use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

use crate::calendar;
use crate::ipc::helpers::{
    optional_i64, require_lecturer_or_admin, require_student, required_date, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

/// Product policy thresholds for the student dashboard. Below the warn level
/// the UI shows a low-attendance banner; below the critical level the course
/// card escalates.
pub const LOW_ATTENDANCE_WARN_PERCENT: i64 = 80;
pub const CRITICAL_ATTENDANCE_PERCENT: i64 = 75;

fn round_percent(numerator: i64, denominator: i64) -> i64 {
    if denominator <= 0 {
        return 100;
    }
    ((numerator as f64 / denominator as f64) * 100.0).round() as i64
}

fn lecturer_holidays(conn: &Connection, lecturer_id: i64) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT date FROM holidays WHERE lecturer_id = ?")?;
    let set = stmt
        .query_map([lecturer_id], |r| r.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;
    Ok(set)
}

fn scheduled_weekdays(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<HashSet<u32>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let set = stmt
        .query_map(params, |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|d| d as u32)
        .collect();
    Ok(set)
}

fn lecturer_reports(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer_or_admin(req)?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(actor.id);
    let start = required_date(&req.params, "startDate")?;
    let end = required_date(&req.params, "endDate")?;
    let start_str = start.format("%Y-%m-%d").to_string();
    let end_str = end.format("%Y-%m-%d").to_string();

    let holidays = lecturer_holidays(conn, lecturer_id)?;

    let mut taught_stmt = conn.prepare(
        "SELECT DISTINCT s.id, s.section_name, c.id, c.title, c.code
         FROM timetable_entries t
         JOIN sections s ON s.id = t.section_id
         JOIN courses c ON c.id = s.course_id
         WHERE t.lecturer_id = ?
         ORDER BY c.code, s.section_name",
    )?;
    let taught = taught_stmt
        .query_map([lecturer_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut reports = Vec::with_capacity(taught.len());
    for (section_id, section_name, course_id, title, code) in taught {
        let course_json = json!({ "id": course_id, "title": title, "code": code });
        let section_json = json!({ "id": section_id, "courseId": course_id, "sectionName": section_name });

        let student_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM enrollments WHERE section_id = ?",
            [section_id],
            |r| r.get(0),
        )?;
        if student_count == 0 {
            reports.push(json!({
                "course": course_json,
                "section": section_json,
                "attendancePercentage": 100,
                "totalMarked": 0,
                "totalPossible": 0,
            }));
            continue;
        }

        let total_marked: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance_records r
             JOIN enrollments e ON e.id = r.enrollment_id
             WHERE e.section_id = ? AND r.date >= ? AND r.date <= ? AND r.status != 'ABSENT'",
            (section_id, &start_str, &end_str),
            |r| r.get(0),
        )?;

        let weekdays = scheduled_weekdays(
            conn,
            "SELECT DISTINCT day_of_week FROM timetable_entries
             WHERE lecturer_id = ?1 AND section_id = ?2",
            (lecturer_id, section_id),
        )?;
        let sessions = calendar::session_day_count(start, end, &weekdays, &holidays) as i64;
        let total_possible = sessions * student_count;

        reports.push(json!({
            "course": course_json,
            "section": section_json,
            "attendancePercentage": round_percent(total_marked, total_possible),
            "totalMarked": total_marked,
            "totalPossible": total_possible,
        }));
    }
    Ok(json!({ "reports": reports }))
}

fn student_summary(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);
    let start = required_date(&req.params, "startDate")?;
    let end = required_date(&req.params, "endDate")?;
    let start_str = start.format("%Y-%m-%d").to_string();
    let end_str = end.format("%Y-%m-%d").to_string();

    let mut enrollment_stmt = conn.prepare(
        "SELECT e.id, e.section_id, c.id, c.title, c.code
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         WHERE e.student_id = ?
         ORDER BY c.code",
    )?;
    let enrollments = enrollment_stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = Vec::with_capacity(enrollments.len());
    for (enrollment_id, section_id, course_id, title, code) in enrollments {
        let weekdays = scheduled_weekdays(
            conn,
            "SELECT DISTINCT day_of_week FROM timetable_entries WHERE section_id = ?",
            [section_id],
        )?;

        // Holidays of every lecturer who teaches this section suppress its
        // session days for the student too.
        let mut holiday_stmt = conn.prepare(
            "SELECT DISTINCT h.date FROM holidays h
             WHERE h.lecturer_id IN
               (SELECT lecturer_id FROM timetable_entries WHERE section_id = ?)",
        )?;
        let holidays: HashSet<String> = holiday_stmt
            .query_map([section_id], |r| r.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;

        let total = calendar::session_day_count(start, end, &weekdays, &holidays) as i64;
        let attended: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance_records
             WHERE enrollment_id = ? AND date >= ? AND date <= ?
               AND status IN ('PRESENT', 'LATE', 'EXCUSED')",
            (enrollment_id, &start_str, &end_str),
            |r| r.get(0),
        )?;

        let percentage = round_percent(attended, total);
        summary.push(json!({
            "courseId": course_id,
            "sectionId": section_id,
            "code": code,
            "title": title,
            "percentage": percentage,
            "attended": attended,
            "total": total,
            "lowAttendance": percentage < LOW_ATTENDANCE_WARN_PERCENT,
            "critical": percentage < CRITICAL_ATTENDANCE_PERCENT,
        }));
    }
    Ok(json!({ "summary": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.lecturer" => Some(with_db(state, req, lecturer_reports)),
        "reports.studentSummary" => Some(with_db(state, req, student_summary)),
        _ => None,
    }
}
