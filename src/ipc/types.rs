use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::model::Actor;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Authenticated caller, supplied by the excluded UI layer. Threaded
    /// explicitly per request; there is no ambient current-user state.
    #[serde(default)]
    pub actor: Option<Actor>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
