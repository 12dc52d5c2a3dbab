use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::helpers::{require_admin, required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;

/// Both importers are row-tolerant: each line is validated on its own, bad
/// lines are reported and skipped, and every valid line is persisted.

fn import_users(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let csv = required_str(&req.params, "csv")?;

    let mut success = 0usize;
    let mut failed = 0usize;
    let mut errors: Vec<String> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    // Line 1 is the header: name,email,college_id,role
    for (idx, line) in csv.trim().lines().skip(1).enumerate() {
        let line_no = idx + 2;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if fields.len() < 4 || fields[..4].iter().any(|f| f.is_empty()) {
            failed += 1;
            errors.push(format!("Line {}: Missing data.", line_no));
            continue;
        }
        let (name, email, college_id, role_raw) = (fields[0], fields[1], fields[2], fields[3]);

        let Some(role) = Role::parse(role_raw) else {
            failed += 1;
            errors.push(format!("Line {}: Invalid role \"{}\".", line_no, role_raw));
            continue;
        };

        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT id FROM users
                 WHERE college_id = ?1 COLLATE NOCASE OR email = ?2 COLLATE NOCASE",
                (college_id, email),
                |r| r.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            failed += 1;
            errors.push(format!(
                "Line {}: User with College ID or Email already exists.",
                line_no
            ));
            continue;
        }

        tx.execute(
            "INSERT INTO users(name, email, college_id, role) VALUES(?, ?, ?, ?)",
            (name, email, college_id, role.as_str()),
        )
        .map_err(HandlerErr::db_update)?;
        success += 1;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "success": success, "failed": failed, "errors": errors }))
}

fn import_enrollments(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let csv = required_str(&req.params, "csv")?;

    let mut success = 0usize;
    let mut failed = 0usize;
    let mut errors: Vec<String> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    // Line 1 is the header: student_college_id,course_code,section_name
    for (idx, line) in csv.trim().lines().skip(1).enumerate() {
        let line_no = idx + 2;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if fields.len() < 3 || fields[..3].iter().any(|f| f.is_empty()) {
            failed += 1;
            errors.push(format!("Line {}: Missing data.", line_no));
            continue;
        }
        let (student_college_id, course_code, section_name) = (fields[0], fields[1], fields[2]);

        let student: Option<i64> = tx
            .query_row(
                "SELECT id FROM users WHERE college_id = ? COLLATE NOCASE AND role = 'STUDENT'",
                [student_college_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(student_id) = student else {
            failed += 1;
            errors.push(format!(
                "Line {}: Student with ID \"{}\" not found.",
                line_no, student_college_id
            ));
            continue;
        };

        let course: Option<i64> = tx
            .query_row(
                "SELECT id FROM courses WHERE code = ? COLLATE NOCASE",
                [course_code],
                |r| r.get(0),
            )
            .optional()?;
        let Some(course_id) = course else {
            failed += 1;
            errors.push(format!(
                "Line {}: Course with code \"{}\" not found.",
                line_no, course_code
            ));
            continue;
        };

        let section: Option<i64> = tx
            .query_row(
                "SELECT id FROM sections WHERE course_id = ? AND section_name = ? COLLATE NOCASE",
                (course_id, section_name),
                |r| r.get(0),
            )
            .optional()?;
        let Some(section_id) = section else {
            failed += 1;
            errors.push(format!(
                "Line {}: Section \"{}\" for course \"{}\" not found.",
                line_no, section_name, course_code
            ));
            continue;
        };

        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT id FROM enrollments WHERE student_id = ? AND section_id = ?",
                (student_id, section_id),
                |r| r.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            failed += 1;
            errors.push(format!(
                "Line {}: Student already enrolled in this section.",
                line_no
            ));
            continue;
        }

        tx.execute(
            "INSERT INTO enrollments(student_id, course_id, section_id) VALUES(?, ?, ?)",
            (student_id, course_id, section_id),
        )
        .map_err(HandlerErr::db_update)?;
        success += 1;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "success": success, "failed": failed, "errors": errors }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.users" => Some(with_db(state, req, import_users)),
        "import.enrollments" => Some(with_db(state, req, import_enrollments)),
        _ => None,
    }
}
