use rusqlite::Connection;
use serde_json::json;

use crate::ipc::helpers::{
    now_iso, optional_i64, require_lecturer, require_student, required_i64, required_str, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer(req)?;
    let course_id = required_i64(&req.params, "courseId")?;
    let section_id = required_i64(&req.params, "sectionId")?;
    let content = required_str(&req.params, "content")?;
    if content.trim().is_empty() {
        return Err(HandlerErr::bad_params("content must not be empty"));
    }

    let created_at = now_iso();
    conn.execute(
        "INSERT INTO announcements(lecturer_id, course_id, section_id, content, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (actor.id, course_id, section_id, content.trim(), &created_at),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({
        "id": conn.last_insert_rowid(),
        "lecturerId": actor.id,
        "courseId": course_id,
        "sectionId": section_id,
        "content": content.trim(),
        "createdAt": created_at,
    }))
}

fn for_student(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(req)?;
    let student_id = optional_i64(&req.params, "studentId").unwrap_or(actor.id);

    let mut stmt = conn.prepare(
        "SELECT a.id, a.content, a.created_at,
                u.id, u.name,
                c.id, c.title, c.code,
                s.id, s.section_name
         FROM announcements a
         LEFT JOIN users u ON u.id = a.lecturer_id
         JOIN courses c ON c.id = a.course_id
         JOIN sections s ON s.id = a.section_id
         WHERE a.section_id IN (SELECT section_id FROM enrollments WHERE student_id = ?)
         ORDER BY a.created_at DESC, a.id DESC",
    )?;
    let announcements = stmt
        .query_map([student_id], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "content": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "lecturer": {
                    "id": r.get::<_, Option<i64>>(3)?,
                    "name": r.get::<_, Option<String>>(4)?.unwrap_or_else(|| "Unknown".to_string()),
                },
                "course": {
                    "id": r.get::<_, i64>(5)?,
                    "title": r.get::<_, String>(6)?,
                    "code": r.get::<_, String>(7)?,
                },
                "section": {
                    "id": r.get::<_, i64>(8)?,
                    "sectionName": r.get::<_, String>(9)?,
                }
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "announcements": announcements }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.create" => Some(with_db(state, req, create)),
        "announcements.forStudent" => Some(with_db(state, req, for_student)),
        _ => None,
    }
}
