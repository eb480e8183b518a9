use crate::backend::{Backend, RestBackend, SqliteBackend};
use crate::config::{self, BackendKind, ImportSettings};
use crate::import::events::EventLog;
use crate::import::parser::SourceFormat;
use crate::import::schema::{EntityKind, ImportMode};
use crate::import::session::ImportSession;
use crate::import::validate::RowValidation;
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::params::{get_optional_str, get_required_str, require_db};
use crate::ipc::types::{AppState, OpenImport, Request};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn get_kind(params: &Value) -> Result<EntityKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    EntityKind::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "kind must be one of: batch, course, student, result (got \"{}\")",
            raw
        ))
    })
}

fn settings(state: &AppState) -> ImportSettings {
    state
        .db
        .as_ref()
        .map(config::import_settings)
        .unwrap_or_default()
}

fn template(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let kind = get_kind(params)?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let groups = match params.get("subjectGroups") {
        None | Some(Value::Null) => settings(state).template_subject_groups,
        Some(v) => v
            .as_u64()
            .filter(|n| (1..=20).contains(n))
            .map(|n| n as usize)
            .ok_or_else(|| HandlerErr::bad_params("subjectGroups must be in 1..=20"))?,
    };

    let schema = kind.schema();
    let header = schema.template_header(groups);
    let line = header
        .iter()
        .map(|c| csv_quote(c))
        .collect::<Vec<_>>()
        .join(",");
    std::fs::write(&out_path, format!("{}\n", line)).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    info!(noun = schema.noun, path = %out_path.display(), "template written");
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "kind": schema.kind.as_str(),
        "columns": header,
        "naturalKeys": schema.natural_keys,
    }))
}

fn connect_backend(
    state: &AppState,
    workspace: &Path,
) -> Result<Box<dyn Backend + Send + Sync>, HandlerErr> {
    let conn = require_db(state)?;
    let settings = config::backend_settings(conn);
    let backend: Box<dyn Backend + Send + Sync> = match settings.kind {
        BackendKind::Local => Box::new(
            SqliteBackend::open(workspace)
                .map_err(|e| HandlerErr::new("backend_failed", e.to_string()))?,
        ),
        BackendKind::Rest => Box::new(
            RestBackend::new(&settings.base_url, Duration::from_secs(settings.timeout_secs))
                .map_err(|e| HandlerErr::new("backend_failed", e.to_string()))?,
        ),
    };
    Ok(backend)
}

fn open(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_db(state)?;
    let Some(workspace) = state.workspace.clone() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let kind = get_kind(params)?;
    let mode = match get_optional_str(params, "mode") {
        Some(raw) => ImportMode::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("mode must be one of: create, update"))?,
        None => settings(state).default_mode(),
    };

    let backend = connect_backend(state, &workspace)?;
    let id = Uuid::new_v4().to_string();
    let session = ImportSession::open(id.clone(), kind, mode, &*backend)
        .map_err(|e| HandlerErr::new("backend_failed", e.to_string()))?;
    let references = session.index().counts();
    state.imports.insert(id.clone(), OpenImport { session, backend });

    Ok(json!({
        "sessionId": id,
        "kind": kind.as_str(),
        "mode": mode.as_str(),
        "references": references,
    }))
}

fn session_id(params: &Value) -> Result<String, HandlerErr> {
    get_required_str(params, "sessionId")
}

fn closed(id: &str) -> HandlerErr {
    HandlerErr::new(
        "session_closed",
        format!("import session {} is not open", id),
    )
}

fn row_json(row: &RowValidation) -> Value {
    json!({
        "row": row.row,
        "valid": row.is_valid(),
        "label": row.record.label(),
        "record": row.record,
        "errors": row.errors,
    })
}

fn load(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let in_path = get_required_str(params, "inPath")?;
    let format = match get_optional_str(params, "format") {
        Some(raw) => SourceFormat::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("format must be csv or xlsx"))?,
        None => SourceFormat::from_path(&in_path).ok_or_else(|| {
            HandlerErr::bad_params("cannot tell the file format from its extension; pass format")
        })?,
    };

    let settings = settings(state);
    let open = state.imports.get_mut(&id).ok_or_else(|| closed(&id))?;
    let bytes = std::fs::read(&in_path).map_err(|e| {
        HandlerErr::new("parse_failed", format!("cannot read {}: {}", in_path, e))
    })?;

    let ctx = settings.validation_context(open.session.mode, chrono::Local::now().date_naive());
    let mut log = EventLog::default();
    let rows = match open.session.load(&bytes, format, &ctx, &mut log) {
        Ok(rows) => rows,
        Err(e) => {
            return Err(HandlerErr::new("parse_failed", e.message)
                .with_details(json!({ "events": log.events })))
        }
    };
    let valid = rows.iter().filter(|r| r.is_valid()).count();

    Ok(json!({
        "sessionId": id,
        "rows": rows.iter().map(row_json).collect::<Vec<_>>(),
        "summary": {
            "total": rows.len(),
            "valid": valid,
            "invalid": rows.len() - valid,
        },
        "events": log.events,
    }))
}

fn execute(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let config = settings(state).executor_config();
    let loaded = state
        .imports
        .get(&id)
        .ok_or_else(|| closed(&id))?
        .session
        .rows()
        .is_some();
    if !loaded {
        return Err(HandlerErr::bad_params("load a file before executing"));
    }
    let OpenImport { session, backend } = state.imports.remove(&id).ok_or_else(|| closed(&id))?;

    let mut log = EventLog::default();
    let outcome = session
        .execute(&*backend, config, &mut log)
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    Ok(json!({
        "sessionId": id,
        "outcome": outcome,
        "events": log.events,
    }))
}

fn close(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = session_id(params)?;
    let existed = state.imports.remove(&id).is_some();
    if existed {
        info!(session = %id, "import session closed");
    }
    Ok(json!({ "closed": existed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "import.template" => template(state, &req.params),
        "import.open" => open(state, &req.params),
        "import.load" => load(state, &req.params),
        "import.execute" => execute(state, &req.params),
        "import.close" => close(state, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
