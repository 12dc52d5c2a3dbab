use rusqlite::Connection;
use serde_json::json;

use crate::db;
use crate::ipc::helpers::{require_actor, require_admin, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn settings_get(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    Ok(json!({ "editWindowDays": db::edit_window_days(conn)? }))
}

fn settings_update(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(req)?;
    if let Some(v) = req.params.get("editWindowDays") {
        let days = v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params("editWindowDays must be an integer"))?;
        if !(0..=365).contains(&days) {
            return Err(HandlerErr::bad_params("editWindowDays must be in 0..=365"));
        }
        db::settings_set_json(conn, "edit_window_days", &json!(days))
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(json!({ "editWindowDays": db::edit_window_days(conn)? }))
}

/// Readable by any authenticated actor: the marking UI shows the window.
fn edit_window(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_actor(req)?;
    Ok(json!({ "editWindowDays": db::edit_window_days(conn)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(with_db(state, req, settings_get)),
        "settings.update" => Some(with_db(state, req, settings_update)),
        "settings.editWindow" => Some(with_db(state, req, edit_window)),
        _ => None,
    }
}
