//! Typed views over the `setup.*` settings sections. Stored JSON is merged
//! over these defaults field by field.

use crate::db;
use crate::import::execute::ExecutorConfig;
use crate::import::schema::ImportMode;
use crate::import::validate::ValidationContext;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const IMPORT_SECTION: &str = "setup.import";
pub const BACKEND_SECTION: &str = "setup.backend";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportSettings {
    pub max_in_flight: usize,
    pub min_year: i32,
    pub future_years: i32,
    pub default_mode: String,
    pub template_subject_groups: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            min_year: 1900,
            future_years: 10,
            default_mode: "create".to_string(),
            template_subject_groups: 3,
        }
    }
}

impl ImportSettings {
    pub fn default_mode(&self) -> ImportMode {
        ImportMode::parse(&self.default_mode).unwrap_or(ImportMode::Create)
    }

    pub fn validation_context(&self, mode: ImportMode, today: NaiveDate) -> ValidationContext {
        ValidationContext {
            mode,
            today,
            min_year: self.min_year,
            future_years: self.future_years,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_in_flight: self.max_in_flight.clamp(1, 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            base_url: String::new(),
            timeout_secs: 30,
        }
    }
}

fn load_section<T: for<'de> Deserialize<'de> + Default>(conn: &Connection, key: &str) -> T {
    db::settings_get_json(conn, key)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn import_settings(conn: &Connection) -> ImportSettings {
    load_section(conn, IMPORT_SECTION)
}

pub fn backend_settings(conn: &Connection) -> BackendSettings {
    load_section(conn, BACKEND_SECTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn missing_sections_use_defaults() {
        let ws = temp_dir("recordsd-config");
        let conn = db::open_db(&ws).expect("open db");
        let import = import_settings(&conn);
        assert_eq!(import.max_in_flight, 1);
        assert_eq!(import.default_mode(), ImportMode::Create);
        assert_eq!(backend_settings(&conn).kind, BackendKind::Local);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn stored_fields_override_defaults_individually() {
        let ws = temp_dir("recordsd-config");
        let conn = db::open_db(&ws).expect("open db");
        db::settings_set_json(&conn, IMPORT_SECTION, &json!({ "maxInFlight": 3, "futureYears": 2 }))
            .expect("save");
        let import = import_settings(&conn);
        assert_eq!(import.executor_config().max_in_flight, 3);
        assert_eq!(import.min_year, 1900);
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        assert_eq!(import.validation_context(ImportMode::Update, today).max_year(), 2026);
        let _ = std::fs::remove_dir_all(ws);
    }
}
