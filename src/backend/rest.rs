//! REST backend: reference collections via `GET {base}/{collection}`, rows via
//! `POST {base}/{collection}` (create) or `PUT {base}/{collection}/{id}`
//! (update). Any non-2xx reply is a row failure carrying the server's
//! message when one is present.

use super::Backend;
use crate::import::error::ExecutionError;
use crate::import::record::{parse_boolish, CandidateRecord, SubRecord};
use crate::import::reference::ReferenceCollections;
use crate::import::schema::{EntityKind, ImportMode};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub struct RestBackend {
    client: Client,
    base_url: String,
}

impl RestBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            anyhow::bail!("backend baseUrl must start with http:// or https://");
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ExecutionError> {
        let url = self.url(path);
        debug!(%url, "fetching reference collection");
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let body = read_success(resp)?;
        serde_json::from_value(unwrap_list(body, path)?)
            .map_err(|e| ExecutionError::Transport(format!("unexpected {} payload: {}", path, e)))
    }
}

pub fn collection_path(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Batch => "batches",
        EntityKind::Course => "courses",
        EntityKind::Student => "students",
        EntityKind::Result => "results",
    }
}

/// Accepts either a bare array or an envelope such as `{"data": [...]}`.
fn unwrap_list(body: Value, path: &str) -> Result<Value, ExecutionError> {
    let list = match body {
        Value::Array(_) => Some(body),
        Value::Object(mut obj) => ["data", "results", "items"]
            .iter()
            .find_map(|k| obj.remove(*k).filter(|v| v.is_array())),
        _ => None,
    };
    list.ok_or_else(|| ExecutionError::Transport(format!("unexpected {} payload shape", path)))
}

fn read_success(resp: Response) -> Result<Value, ExecutionError> {
    let status = resp.status();
    let text = resp
        .text()
        .map_err(|e| ExecutionError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(ExecutionError::Rejected {
            status: status.as_u16(),
            message: error_message(status.as_u16(), &text),
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ExecutionError::Transport(e.to_string()))
}

/// Server message from `message`, `error`, `detail` (string or first of a
/// list), or the raw body; falls back to the status line.
pub fn error_message(status: u16, body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error", "detail"] {
            match v.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => return s.trim().to_string(),
                Some(Value::Array(items)) => {
                    if let Some(s) = items.iter().find_map(|i| i.as_str()) {
                        return s.to_string();
                    }
                }
                Some(Value::Object(o)) => {
                    if let Some(s) = o.get("message").and_then(|m| m.as_str()) {
                        return s.to_string();
                    }
                }
                _ => {}
            }
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('<') {
        return trimmed.to_string();
    }
    format!("server returned status {}", status)
}

fn num(v: &Option<String>) -> Value {
    v.as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(Value::from)
        .unwrap_or(Value::Null)
}

fn sub_record_json(s: &SubRecord) -> Value {
    json!({
        "name": s.name,
        "subjectType": s.subject_type.as_deref().map(|t| t.to_ascii_lowercase()),
        "subjectId": s.subject_id,
        "te": num(&s.te),
        "ce": num(&s.ce),
        "pe": num(&s.pe),
        "pw": num(&s.pw),
    })
}

/// Request body for one record, using resolved identifiers.
pub fn payload(record: &CandidateRecord) -> Value {
    match record {
        CandidateRecord::Batch(b) => json!({
            "name": b.name,
            "startDate": b.start_date,
            "durationMonths": num(&b.duration_months),
            "courseId": b.course_id,
        }),
        CandidateRecord::Course(c) => json!({
            "name": c.name,
            "shortCode": c.short_code,
            "durationMonths": num(&c.duration_months),
            "subjects": c.subjects.iter().map(sub_record_json).collect::<Vec<_>>(),
        }),
        CandidateRecord::Student(s) => json!({
            "name": s.name,
            "email": s.email,
            "phone": s.phone,
            "birthDate": s.birth_date,
            "courseId": s.course_id,
            "batchId": s.batch_id,
        }),
        CandidateRecord::Result(r) => json!({
            "studentId": r.student_id,
            "courseId": r.course_id,
            "batchId": r.batch_id,
            "registerNo": r.register_no,
            "certificateNo": r.certificate_no,
            "result": r.result,
            "isPublished": r.is_published.as_deref().and_then(parse_boolish).unwrap_or(false),
            "publishedDate": r.published_date,
            "marks": r.marks.iter().map(sub_record_json).collect::<Vec<_>>(),
        }),
    }
}

fn response_id(body: &Value) -> Option<i64> {
    body.get("id")
        .or_else(|| body.pointer("/data/id"))
        .and_then(|v| v.as_i64())
}

impl Backend for RestBackend {
    fn fetch_references(&self) -> Result<ReferenceCollections, ExecutionError> {
        Ok(ReferenceCollections {
            courses: self.get_list("courses")?,
            subjects: self.get_list("subjects")?,
            batches: self.get_list("batches")?,
            students: self.get_list("students")?,
            results: self.get_list("results")?,
        })
    }

    /// Any 2xx counts as saved, with or without an id in the reply.
    fn submit(
        &self,
        mode: ImportMode,
        record: &CandidateRecord,
    ) -> Result<Option<i64>, ExecutionError> {
        let collection = collection_path(record.kind());
        let body = payload(record);
        let request = match mode {
            ImportMode::Create => self.client.post(self.url(collection)),
            ImportMode::Update => {
                let id = record.target_id().ok_or_else(|| {
                    ExecutionError::NotFound(format!(
                        "no existing record for \"{}\"",
                        record.label()
                    ))
                })?;
                self.client.put(self.url(&format!("{}/{}", collection, id)))
            }
        };
        let resp = request
            .json(&body)
            .send()
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let reply = read_success(resp)?;
        Ok(response_id(&reply).or_else(|| record.target_id()))
    }
}
