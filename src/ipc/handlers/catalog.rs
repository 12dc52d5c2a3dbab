use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::helpers::{require_admin, required_i64, required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn catalog_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.section_name, c.id, c.title, c.code
         FROM sections s
         JOIN courses c ON c.id = s.course_id
         ORDER BY c.code, s.section_name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "section": {
                    "id": r.get::<_, i64>(0)?,
                    "sectionName": r.get::<_, String>(1)?,
                    "courseId": r.get::<_, i64>(2)?,
                },
                "course": {
                    "id": r.get::<_, i64>(2)?,
                    "title": r.get::<_, String>(3)?,
                    "code": r.get::<_, String>(4)?,
                }
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "coursesSections": rows }))
}

fn catalog_create_course(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let title = required_str(&req.params, "title")?;
    let code = required_str(&req.params, "code")?;
    if title.trim().is_empty() || code.trim().is_empty() {
        return Err(HandlerErr::bad_params("title and code are required"));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM courses WHERE code = ? COLLATE NOCASE",
            [code.trim()],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::duplicate(format!(
            "Course with code \"{}\" already exists.",
            code.trim()
        )));
    }

    conn.execute(
        "INSERT INTO courses(title, code) VALUES(?, ?)",
        (title.trim(), code.trim()),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({
        "id": conn.last_insert_rowid(),
        "title": title.trim(),
        "code": code.trim(),
    }))
}

fn catalog_create_section(
    conn: &Connection,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let course_id = required_i64(&req.params, "courseId")?;
    let section_name = required_str(&req.params, "sectionName")?;
    if section_name.trim().is_empty() {
        return Err(HandlerErr::bad_params("sectionName is required"));
    }

    let course: Option<i64> = conn
        .query_row("SELECT id FROM courses WHERE id = ?", [course_id], |r| {
            r.get(0)
        })
        .optional()?;
    if course.is_none() {
        return Err(HandlerErr::not_found("Course not found."));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM sections WHERE course_id = ? AND section_name = ? COLLATE NOCASE",
            (course_id, section_name.trim()),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::duplicate(format!(
            "Section \"{}\" already exists for this course.",
            section_name.trim()
        )));
    }

    conn.execute(
        "INSERT INTO sections(course_id, section_name) VALUES(?, ?)",
        (course_id, section_name.trim()),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({
        "id": conn.last_insert_rowid(),
        "courseId": course_id,
        "sectionName": section_name.trim(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.list" => Some(with_db(state, req, catalog_list)),
        "catalog.createCourse" => Some(with_db(state, req, catalog_create_course)),
        "catalog.createSection" => Some(with_db(state, req, catalog_create_section)),
        _ => None,
    }
}
