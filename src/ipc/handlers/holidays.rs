use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::helpers::{
    optional_i64, require_actor, require_lecturer_or_admin, required_date, required_i64,
    required_str, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn holidays_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(req)?;
    let lecturer_id = optional_i64(&req.params, "lecturerId").unwrap_or(actor.id);
    let mut stmt = conn.prepare(
        "SELECT id, date, reason FROM holidays WHERE lecturer_id = ? ORDER BY date",
    )?;
    let holidays = stmt
        .query_map([lecturer_id], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "date": r.get::<_, String>(1)?,
                "reason": r.get::<_, String>(2)?,
                "lecturerId": lecturer_id,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "holidays": holidays }))
}

fn holidays_add(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_lecturer_or_admin(req)?;
    let date = required_date(&req.params, "date")?
        .format("%Y-%m-%d")
        .to_string();
    let reason = required_str(&req.params, "reason")?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM holidays WHERE lecturer_id = ? AND date = ?",
            (actor.id, &date),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::duplicate(
            "A holiday for this date has already been added.",
        ));
    }

    conn.execute(
        "INSERT INTO holidays(lecturer_id, date, reason) VALUES(?, ?, ?)",
        (actor.id, &date, &reason),
    )
    .map_err(HandlerErr::db_update)?;
    Ok(json!({
        "id": conn.last_insert_rowid(),
        "date": date,
        "reason": reason,
        "lecturerId": actor.id,
    }))
}

fn holidays_remove(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_actor(req)?;
    let holiday_id = required_i64(&req.params, "holidayId")?;
    let removed = conn
        .execute("DELETE FROM holidays WHERE id = ?", [holiday_id])
        .map_err(HandlerErr::db_update)?;
    if removed == 0 {
        return Err(HandlerErr::not_found("Holiday not found."));
    }
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "holidays.list" => Some(with_db(state, req, holidays_list)),
        "holidays.add" => Some(with_db(state, req, holidays_add)),
        "holidays.remove" => Some(with_db(state, req, holidays_remove)),
        _ => None,
    }
}
