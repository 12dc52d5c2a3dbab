use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::helpers::{
    optional_str, require_admin, required_i64, required_str, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;

fn user_json(id: i64, name: &str, email: &str, college_id: &str, role: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "email": email,
        "collegeId": college_id,
        "role": role,
    })
}

fn users_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let mut stmt =
        conn.prepare("SELECT id, name, email, college_id, role FROM users ORDER BY id")?;
    let users = stmt
        .query_map([], |r| {
            Ok(user_json(
                r.get(0)?,
                &r.get::<_, String>(1)?,
                &r.get::<_, String>(2)?,
                &r.get::<_, String>(3)?,
                &r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn user_exists_by_key(
    conn: &Connection,
    college_id: &str,
    email: &str,
    exclude_id: Option<i64>,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM users
             WHERE (college_id = ?1 COLLATE NOCASE OR email = ?2 COLLATE NOCASE)
               AND id != ?3",
            (college_id, email, exclude_id.unwrap_or(-1)),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn users_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let name = required_str(&req.params, "name")?;
    let email = required_str(&req.params, "email")?;
    let college_id = required_str(&req.params, "collegeId")?;
    let role_raw = required_str(&req.params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("invalid role \"{}\"", role_raw)))?;
    if name.trim().is_empty() || email.trim().is_empty() || college_id.trim().is_empty() {
        return Err(HandlerErr::bad_params("name, email and collegeId are required"));
    }

    if user_exists_by_key(conn, &college_id, &email, None)? {
        return Err(HandlerErr::duplicate(
            "User with this College ID or Email already exists.",
        ));
    }

    conn.execute(
        "INSERT INTO users(name, email, college_id, role) VALUES(?, ?, ?, ?)",
        (name.trim(), email.trim(), college_id.trim(), role.as_str()),
    )
    .map_err(HandlerErr::db_update)?;
    let id = conn.last_insert_rowid();
    Ok(user_json(id, name.trim(), email.trim(), college_id.trim(), role.as_str()))
}

fn users_update(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let user_id = required_i64(&req.params, "userId")?;

    let existing: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT name, email, college_id, role FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((cur_name, cur_email, cur_college, cur_role)) = existing else {
        return Err(HandlerErr::not_found("User not found."));
    };

    let name = optional_str(&req.params, "name").unwrap_or(cur_name);
    let email = optional_str(&req.params, "email").unwrap_or(cur_email);
    let college_id = optional_str(&req.params, "collegeId").unwrap_or(cur_college);
    let role = match optional_str(&req.params, "role") {
        Some(raw) => Role::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params(format!("invalid role \"{}\"", raw)))?
            .as_str()
            .to_string(),
        None => cur_role,
    };

    if user_exists_by_key(conn, &college_id, &email, Some(user_id))? {
        return Err(HandlerErr::duplicate(
            "User with this College ID or Email already exists.",
        ));
    }

    conn.execute(
        "UPDATE users SET name = ?, email = ?, college_id = ?, role = ? WHERE id = ?",
        (&name, &email, &college_id, &role, user_id),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(user_json(user_id, &name, &email, &college_id, &role))
}

fn users_delete(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let user_id = required_i64(&req.params, "userId")?;
    let removed = conn
        .execute("DELETE FROM users WHERE id = ?", [user_id])
        .map_err(HandlerErr::db_update)?;
    if removed == 0 {
        return Err(HandlerErr::not_found("User not found."));
    }
    Ok(json!({ "success": true }))
}

fn admin_stats(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    let students: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'STUDENT'",
        [],
        |r| r.get(0),
    )?;
    let lecturers: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'LECTURER'",
        [],
        |r| r.get(0),
    )?;
    Ok(json!({
        "totalUsers": total,
        "totalStudents": students,
        "totalLecturers": lecturers,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_db(state, req, users_list)),
        "users.create" => Some(with_db(state, req, users_create)),
        "users.update" => Some(with_db(state, req, users_update)),
        "users.delete" => Some(with_db(state, req, users_delete)),
        "admin.stats" => Some(with_db(state, req, admin_stats)),
        _ => None,
    }
}
