use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line on stdin: `{ "id": ..., "method": "results.recompute", "params": {...} }`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state: the selected workspace directory and, once selected, the
/// open handle to its `marksheet.sqlite3`. Backup import drops the handle
/// before replacing the file and reopens afterwards.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
