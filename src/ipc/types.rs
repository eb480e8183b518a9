use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::backend::Backend;
use crate::import::session::ImportSession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An open import dialog: the session plus the backend it was opened
/// against, so execution talks to the same collaborator that supplied the
/// reference collections.
pub struct OpenImport {
    pub session: ImportSession,
    pub backend: Box<dyn Backend + Send + Sync>,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub imports: HashMap<String, OpenImport>,
}
