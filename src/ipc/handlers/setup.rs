use crate::config::{self, BackendSettings, ImportSettings};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Import,
    Backend,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "backend" => Some(Self::Backend),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Import => config::IMPORT_SECTION,
            Self::Backend => config::BACKEND_SECTION,
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    let value = match section {
        SetupSection::Import => serde_json::to_value(ImportSettings::default()),
        SetupSection::Backend => serde_json::to_value(BackendSettings::default()),
    };
    value.unwrap_or_else(|_| json!({}))
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_one_of(v: &Value, key: &str, allowed: &[&str]) -> Result<String, String> {
    let s = parse_string_max(v, key, 16)?.to_ascii_lowercase();
    if !allowed.contains(&s.as_str()) {
        return Err(format!("{} must be one of: {}", key, allowed.join(", ")));
    }
    Ok(s)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Import => match k.as_str() {
                "maxInFlight" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 8)?));
                }
                "minYear" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1800, 2100)?));
                }
                "futureYears" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                "defaultMode" => {
                    obj.insert(k.clone(), Value::String(parse_one_of(v, k, &["create", "update"])?));
                }
                "templateSubjectGroups" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 20)?));
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
            SetupSection::Backend => match k.as_str() {
                "kind" => {
                    obj.insert(k.clone(), Value::String(parse_one_of(v, k, &["local", "rest"])?));
                }
                "baseUrl" => {
                    let url = parse_string_max(v, k, 500)?;
                    if !url.is_empty()
                        && !(url.starts_with("http://") || url.starts_with("https://"))
                    {
                        return Err("baseUrl must start with http:// or https://".into());
                    }
                    obj.insert(k.clone(), Value::String(url));
                }
                "timeoutSecs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 300)?));
                }
                _ => return Err(format!("unknown backend field: {}", k)),
            },
        }
    }
    if let SetupSection::Backend = section {
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("local");
        let base = obj.get("baseUrl").and_then(|v| v.as_str()).unwrap_or("");
        if kind == "rest" && base.is_empty() {
            return Err("baseUrl is required when kind is rest".into());
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let import = match load_section(conn, SetupSection::Import) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let backend = match load_section(conn, SetupSection::Backend) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "import": import, "backend": backend }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.key(), "settings updated");
    ok(&req.id, json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
