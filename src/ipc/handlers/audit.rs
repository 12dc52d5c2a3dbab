use rusqlite::Connection;
use serde_json::json;

use crate::ipc::helpers::{require_admin, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// Full audit trail for admins: every status transition joined with the
/// people and course it concerns, newest first.
fn system_log(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let mut stmt = conn.prepare(
        "SELECT a.id, a.changed_at, a.old_status, a.new_status,
                student.name, student.college_id,
                changer.name,
                c.title, c.code, s.section_name
         FROM attendance_audits a
         JOIN attendance_records r ON r.id = a.record_id
         JOIN enrollments e ON e.id = r.enrollment_id
         LEFT JOIN users student ON student.id = e.student_id
         LEFT JOIN users changer ON changer.id = a.changed_by
         LEFT JOIN courses c ON c.id = e.course_id
         LEFT JOIN sections s ON s.id = e.section_id
         ORDER BY a.changed_at DESC, a.id DESC",
    )?;
    let logs = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "changedAt": r.get::<_, String>(1)?,
                "oldStatus": r.get::<_, Option<String>>(2)?,
                "newStatus": r.get::<_, String>(3)?,
                "studentName": r.get::<_, Option<String>>(4)?.unwrap_or_else(|| "N/A".to_string()),
                "studentCollegeId": r.get::<_, Option<String>>(5)?.unwrap_or_else(|| "N/A".to_string()),
                "changerName": r.get::<_, Option<String>>(6)?.unwrap_or_else(|| "N/A".to_string()),
                "courseTitle": r.get::<_, Option<String>>(7)?.unwrap_or_else(|| "N/A".to_string()),
                "courseCode": r.get::<_, Option<String>>(8)?.unwrap_or_else(|| "N/A".to_string()),
                "sectionName": r.get::<_, Option<String>>(9)?.unwrap_or_else(|| "N/A".to_string()),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "logs": logs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.systemLog" => Some(with_db(state, req, system_log)),
        _ => None,
    }
}
