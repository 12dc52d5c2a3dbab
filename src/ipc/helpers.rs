use chrono::{NaiveDate, Utc};

use crate::calendar;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{Actor, AttendanceStatus, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new("duplicate", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    pub fn db_update(e: rusqlite::Error) -> Self {
        Self::new("db_update_failed", e.to_string())
    }

    pub fn db_tx(e: rusqlite::Error) -> Self {
        Self::new("db_tx_failed", e.to_string())
    }

    pub fn db_commit(e: rusqlite::Error) -> Self {
        Self::new("db_commit_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Standard dispatch shell: require an open workspace, run the handler body,
/// wrap the outcome in the protocol envelope.
pub fn with_db(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&rusqlite::Connection, &Request) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

// --- actor guards ---

pub fn require_actor(req: &Request) -> Result<Actor, HandlerErr> {
    req.actor
        .ok_or_else(|| HandlerErr::unauthorized("Unauthorized"))
}

pub fn require_admin(req: &Request) -> Result<Actor, HandlerErr> {
    let actor = require_actor(req)?;
    if actor.role != Role::Admin {
        return Err(HandlerErr::unauthorized(
            "Unauthorized: Admin access required.",
        ));
    }
    Ok(actor)
}

pub fn require_student(req: &Request) -> Result<Actor, HandlerErr> {
    let actor = require_actor(req)?;
    if actor.role != Role::Student {
        return Err(HandlerErr::unauthorized(
            "Unauthorized: Student access required.",
        ));
    }
    Ok(actor)
}

pub fn require_lecturer(req: &Request) -> Result<Actor, HandlerErr> {
    let actor = require_actor(req)?;
    if actor.role != Role::Lecturer {
        return Err(HandlerErr::unauthorized(
            "Unauthorized: Lecturer access required.",
        ));
    }
    Ok(actor)
}

pub fn require_lecturer_or_admin(req: &Request) -> Result<Actor, HandlerErr> {
    let actor = require_actor(req)?;
    if actor.role != Role::Lecturer && actor.role != Role::Admin {
        return Err(HandlerErr::unauthorized("Unauthorized"));
    }
    Ok(actor)
}

// --- param extraction ---

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn required_array<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a Vec<serde_json::Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    calendar::parse_date(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn required_status(
    params: &serde_json::Value,
    key: &str,
) -> Result<AttendanceStatus, HandlerErr> {
    let raw = required_str(params, key)?;
    AttendanceStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("invalid status \"{}\"", raw)))
}

// --- time ---

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}
