//! Thin CRUD over the local workspace store. Creation runs the same
//! resolve and validate stages as a one-row import, so a record entered by
//! hand obeys exactly the rules an imported one does.

use crate::backend::store::{delete_record, load_references, save_record};
use crate::config;
use crate::import::error::ExecutionError;
use crate::import::record::{
    BatchDraft, CandidateRecord, CourseDraft, StudentDraft, SubRecord,
};
use crate::import::reference::{resolve, ReferenceIndex};
use crate::import::schema::{EntityKind, ImportMode};
use crate::import::validate::{validate, ResolvedRow};
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::params::{get_cell_text, get_required_i64, require_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

fn query_list(
    conn: &Connection,
    sql: &str,
    map: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<Value>,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    stmt.query_map([], |r| map(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn list_courses(conn: &Connection) -> Result<Value, HandlerErr> {
    let subjects = query_list(
        conn,
        "SELECT course_id, id, name, subject_type, te_max, ce_max, pe_max, pw_max
         FROM subjects ORDER BY course_id, sort_order",
        |r| {
            Ok(json!({
                "courseId": r.get::<_, i64>(0)?,
                "id": r.get::<_, i64>(1)?,
                "name": r.get::<_, String>(2)?,
                "subjectType": r.get::<_, String>(3)?,
                "teMax": r.get::<_, Option<f64>>(4)?,
                "ceMax": r.get::<_, Option<f64>>(5)?,
                "peMax": r.get::<_, Option<f64>>(6)?,
                "pwMax": r.get::<_, Option<f64>>(7)?,
            }))
        },
    )?;
    let mut courses = query_list(
        conn,
        "SELECT id, name, short_code, duration_months FROM courses ORDER BY name COLLATE NOCASE",
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "shortCode": r.get::<_, String>(2)?,
                "durationMonths": r.get::<_, i64>(3)?,
                "subjects": [],
            }))
        },
    )?;
    for course in courses.iter_mut() {
        let id = course["id"].clone();
        course["subjects"] = Value::Array(
            subjects
                .iter()
                .filter(|s| s["courseId"] == id)
                .cloned()
                .collect(),
        );
    }
    Ok(json!({ "courses": courses }))
}

fn list_batches(conn: &Connection) -> Result<Value, HandlerErr> {
    let batches = query_list(
        conn,
        "SELECT b.id, b.name, b.start_date, b.duration_months, b.course_id, c.name
         FROM batches b
         JOIN courses c ON c.id = b.course_id
         ORDER BY b.name COLLATE NOCASE",
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "durationMonths": r.get::<_, i64>(3)?,
                "courseId": r.get::<_, i64>(4)?,
                "courseName": r.get::<_, String>(5)?,
            }))
        },
    )?;
    Ok(json!({ "batches": batches }))
}

fn list_students(conn: &Connection) -> Result<Value, HandlerErr> {
    let students = query_list(
        conn,
        "SELECT s.id, s.name, s.email, s.phone, s.birth_date, s.course_id, s.batch_id, b.name
         FROM students s
         LEFT JOIN batches b ON b.id = s.batch_id
         ORDER BY s.name COLLATE NOCASE, s.id",
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "birthDate": r.get::<_, Option<String>>(4)?,
                "courseId": r.get::<_, Option<i64>>(5)?,
                "batchId": r.get::<_, Option<i64>>(6)?,
                "batchName": r.get::<_, Option<String>>(7)?,
            }))
        },
    )?;
    Ok(json!({ "students": students }))
}

fn list_results(conn: &Connection) -> Result<Value, HandlerErr> {
    let results = query_list(
        conn,
        "SELECT r.id, r.register_no, r.certificate_no, r.result, r.is_published, r.published_date,
                r.student_id, s.name, r.course_id, r.batch_id,
                (SELECT COUNT(*) FROM result_marks m WHERE m.result_id = r.id)
         FROM results r
         JOIN students s ON s.id = r.student_id
         ORDER BY r.register_no COLLATE NOCASE",
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "registerNo": r.get::<_, String>(1)?,
                "certificateNo": r.get::<_, Option<String>>(2)?,
                "result": r.get::<_, String>(3)?,
                "isPublished": r.get::<_, i64>(4)? != 0,
                "publishedDate": r.get::<_, Option<String>>(5)?,
                "studentId": r.get::<_, i64>(6)?,
                "studentName": r.get::<_, String>(7)?,
                "courseId": r.get::<_, i64>(8)?,
                "batchId": r.get::<_, i64>(9)?,
                "markCount": r.get::<_, i64>(10)?,
            }))
        },
    )?;
    Ok(json!({ "results": results }))
}

fn subject_from_params(v: &Value) -> SubRecord {
    SubRecord {
        name: get_cell_text(v, "name"),
        subject_type: get_cell_text(v, "type"),
        te: get_cell_text(v, "teMax"),
        ce: get_cell_text(v, "ceMax"),
        pe: get_cell_text(v, "peMax"),
        pw: get_cell_text(v, "pwMax"),
        subject_id: None,
    }
}

fn draft_from_params(kind: EntityKind, p: &Value) -> Result<CandidateRecord, HandlerErr> {
    Ok(match kind {
        EntityKind::Batch => CandidateRecord::Batch(BatchDraft {
            name: get_cell_text(p, "name"),
            start_date: get_cell_text(p, "startDate"),
            duration_months: get_cell_text(p, "durationMonths"),
            course: get_cell_text(p, "course"),
            ..Default::default()
        }),
        EntityKind::Course => CandidateRecord::Course(CourseDraft {
            name: get_cell_text(p, "name"),
            short_code: get_cell_text(p, "shortCode"),
            duration_months: get_cell_text(p, "durationMonths"),
            subjects: p
                .get("subjects")
                .and_then(|v| v.as_array())
                .map(|items| items.iter().map(subject_from_params).collect())
                .unwrap_or_default(),
            target_id: None,
        }),
        EntityKind::Student => CandidateRecord::Student(StudentDraft {
            name: get_cell_text(p, "name"),
            email: get_cell_text(p, "email"),
            phone: get_cell_text(p, "phone"),
            birth_date: get_cell_text(p, "birthDate"),
            course: get_cell_text(p, "course"),
            batch: get_cell_text(p, "batch"),
            ..Default::default()
        }),
        EntityKind::Result => {
            return Err(HandlerErr::bad_params(
                "results are created through import",
            ))
        }
    })
}

fn execution_err(e: ExecutionError) -> HandlerErr {
    let code = match &e {
        ExecutionError::Conflict(_) => "conflict",
        ExecutionError::NotFound(_) => "not_found",
        _ => "db_insert_failed",
    };
    HandlerErr::new(code, e.to_string())
}

fn create_record(state: &AppState, kind: EntityKind, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut record = draft_from_params(kind, params)?;
    let refs = load_references(conn).map_err(HandlerErr::query)?;
    let index = ReferenceIndex::build(refs);
    let issues = resolve(&mut record, &index);

    let ctx = config::import_settings(conn)
        .validation_context(ImportMode::Create, chrono::Local::now().date_naive());
    let mut checked = validate(vec![ResolvedRow { row: 1, record, issues }], &index, &ctx);
    let Some(row) = checked.pop() else {
        return Err(HandlerErr::new("db_insert_failed", "nothing to save"));
    };
    if !row.is_valid() {
        return Err(HandlerErr::new("validation_failed", row.messages().join("; "))
            .with_details(json!({ "errors": row.errors })));
    }

    let id = save_record(conn, ImportMode::Create, &row.record).map_err(execution_err)?;
    info!(kind = kind.as_str(), id, "record created");
    Ok(json!({ "id": id }))
}

fn remove_record(state: &AppState, kind: EntityKind, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_i64(params, "id")?;
    delete_record(conn, kind, id).map_err(execution_err)?;
    info!(kind = kind.as_str(), id, "record deleted");
    Ok(json!({ "ok": true }))
}

fn list_records(state: &AppState, kind: EntityKind) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    match kind {
        EntityKind::Course => list_courses(conn),
        EntityKind::Batch => list_batches(conn),
        EntityKind::Student => list_students(conn),
        EntityKind::Result => list_results(conn),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let (collection, action) = req.method.split_once('.')?;
    let kind = match collection {
        "courses" => EntityKind::Course,
        "batches" => EntityKind::Batch,
        "students" => EntityKind::Student,
        "results" => EntityKind::Result,
        _ => return None,
    };
    let result = match (kind, action) {
        (_, "list") => list_records(state, kind),
        (EntityKind::Result, "create") => return None,
        (_, "create") => create_record(state, kind, &req.params),
        (_, "delete") => remove_record(state, kind, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
