//! Local workspace store (SQLite) acting as the records backend.
//!
//! Every submitted row runs in its own transaction, so a failing row never
//! rolls back rows saved before it.

use super::Backend;
use crate::db;
use crate::import::error::ExecutionError;
use crate::import::record::{
    parse_boolish, BatchDraft, CandidateRecord, CourseDraft, ResultDraft, StudentDraft, SubRecord,
};
use crate::import::reference::{
    BatchRef, CourseRef, ReferenceCollections, ResultRef, StudentRef, SubjectRef,
};
use crate::import::schema::{EntityKind, ImportMode};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_db(workspace)?),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, ExecutionError>,
    ) -> Result<T, ExecutionError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| ExecutionError::Store("store lock poisoned".to_string()))?;
        f(&guard)
    }
}

impl Backend for SqliteBackend {
    fn fetch_references(&self) -> Result<ReferenceCollections, ExecutionError> {
        self.with_conn(|conn| Ok(load_references(conn)?))
    }

    fn submit(
        &self,
        mode: ImportMode,
        record: &CandidateRecord,
    ) -> Result<Option<i64>, ExecutionError> {
        self.with_conn(|conn| save_record(conn, mode, record).map(Some))
    }
}

fn now_unix_string() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

pub fn load_references(conn: &Connection) -> rusqlite::Result<ReferenceCollections> {
    let courses = conn
        .prepare("SELECT id, name, short_code FROM courses ORDER BY id")?
        .query_map([], |r| {
            Ok(CourseRef {
                id: r.get(0)?,
                name: r.get(1)?,
                short_code: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let subjects = conn
        .prepare(
            "SELECT id, course_id, name, subject_type, te_max, ce_max, pe_max, pw_max
             FROM subjects ORDER BY course_id, sort_order",
        )?
        .query_map([], |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                course_id: r.get(1)?,
                name: r.get(2)?,
                subject_type: r.get(3)?,
                te_max: r.get(4)?,
                ce_max: r.get(5)?,
                pe_max: r.get(6)?,
                pw_max: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let batches = conn
        .prepare("SELECT id, name, course_id FROM batches ORDER BY id")?
        .query_map([], |r| {
            Ok(BatchRef {
                id: r.get(0)?,
                name: r.get(1)?,
                course_id: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let students = conn
        .prepare("SELECT id, name, email, course_id, batch_id FROM students ORDER BY id")?
        .query_map([], |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                course_id: r.get(3)?,
                batch_id: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let results = conn
        .prepare("SELECT id, student_id, course_id, register_no FROM results ORDER BY id")?
        .query_map([], |r| {
            Ok(ResultRef {
                id: r.get(0)?,
                student_id: r.get(1)?,
                course_id: r.get(2)?,
                register_no: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ReferenceCollections {
        courses,
        subjects,
        batches,
        students,
        results,
    })
}

pub fn save_record(
    conn: &Connection,
    mode: ImportMode,
    record: &CandidateRecord,
) -> Result<i64, ExecutionError> {
    let tx = conn.unchecked_transaction()?;
    let id = match (mode, record) {
        (ImportMode::Create, CandidateRecord::Batch(b)) => insert_batch(&tx, b)?,
        (ImportMode::Create, CandidateRecord::Course(c)) => insert_course(&tx, c)?,
        (ImportMode::Create, CandidateRecord::Student(s)) => insert_student(&tx, s)?,
        (ImportMode::Create, CandidateRecord::Result(r)) => insert_result(&tx, r)?,
        (ImportMode::Update, rec) => {
            let id = rec.target_id().ok_or_else(|| {
                ExecutionError::NotFound(format!("no existing record for \"{}\"", rec.label()))
            })?;
            match rec {
                CandidateRecord::Batch(b) => update_batch(&tx, id, b)?,
                CandidateRecord::Course(c) => update_course(&tx, id, c)?,
                CandidateRecord::Student(s) => update_student(&tx, id, s)?,
                CandidateRecord::Result(r) => update_result(&tx, id, r)?,
            }
            id
        }
    };
    tx.commit()?;
    Ok(id)
}

fn required<'a>(v: &'a Option<String>, what: &str) -> Result<&'a str, ExecutionError> {
    v.as_deref()
        .ok_or_else(|| ExecutionError::Store(format!("missing {}", what)))
}

fn required_id(v: Option<i64>, what: &str) -> Result<i64, ExecutionError> {
    v.ok_or_else(|| ExecutionError::Store(format!("unresolved {}", what)))
}

fn months(v: &Option<String>) -> Result<i64, ExecutionError> {
    let raw = required(v, "duration")?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|n| *n > 0.0 && n.fract() == 0.0)
        .map(|n| n as i64)
        .ok_or_else(|| ExecutionError::Store(format!("invalid duration \"{}\"", raw)))
}

fn number(v: &Option<String>) -> Option<f64> {
    v.as_deref().and_then(|s| s.trim().parse::<f64>().ok())
}

fn exists(conn: &Connection, sql: &str, param: &str) -> Result<bool, ExecutionError> {
    Ok(conn
        .query_row(sql, [param], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn insert_batch(conn: &Connection, b: &BatchDraft) -> Result<i64, ExecutionError> {
    let name = required(&b.name, "batch name")?;
    if exists(conn, "SELECT id FROM batches WHERE name = ? COLLATE NOCASE", name)? {
        return Err(ExecutionError::Conflict(format!(
            "Batch \"{}\" already exists",
            name
        )));
    }
    conn.execute(
        "INSERT INTO batches(course_id, name, start_date, duration_months, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            required_id(b.course_id, "course")?,
            name,
            required(&b.start_date, "start date")?,
            months(&b.duration_months)?,
            now_unix_string(),
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_batch(conn: &Connection, id: i64, b: &BatchDraft) -> Result<(), ExecutionError> {
    let changed = conn.execute(
        "UPDATE batches SET course_id = ?, start_date = ?, duration_months = ?, updated_at = ?
         WHERE id = ?",
        (
            required_id(b.course_id, "course")?,
            required(&b.start_date, "start date")?,
            months(&b.duration_months)?,
            now_unix_string(),
            id,
        ),
    )?;
    if changed == 0 {
        return Err(ExecutionError::NotFound(format!("batch {} no longer exists", id)));
    }
    Ok(())
}

fn insert_subject(
    conn: &Connection,
    course_id: i64,
    s: &SubRecord,
    sort_order: i64,
) -> Result<(), ExecutionError> {
    conn.execute(
        "INSERT INTO subjects(course_id, name, subject_type, te_max, ce_max, pe_max, pw_max, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            course_id,
            required(&s.name, "subject name")?,
            required(&s.subject_type, "subject type")?.to_ascii_lowercase(),
            number(&s.te),
            number(&s.ce),
            number(&s.pe),
            number(&s.pw),
            sort_order,
        ),
    )?;
    Ok(())
}

fn insert_course(conn: &Connection, c: &CourseDraft) -> Result<i64, ExecutionError> {
    let name = required(&c.name, "course name")?;
    let code = required(&c.short_code, "short code")?;
    if exists(conn, "SELECT id FROM courses WHERE name = ? COLLATE NOCASE", name)? {
        return Err(ExecutionError::Conflict(format!(
            "Course \"{}\" already exists",
            name
        )));
    }
    if exists(
        conn,
        "SELECT id FROM courses WHERE short_code = ? COLLATE NOCASE",
        code,
    )? {
        return Err(ExecutionError::Conflict(format!(
            "Short code \"{}\" is already in use",
            code
        )));
    }
    conn.execute(
        "INSERT INTO courses(name, short_code, duration_months, updated_at) VALUES(?, ?, ?, ?)",
        (name, code, months(&c.duration_months)?, now_unix_string()),
    )?;
    let course_id = conn.last_insert_rowid();
    for (i, s) in c.subjects.iter().enumerate() {
        insert_subject(conn, course_id, s, i as i64)?;
    }
    Ok(course_id)
}

/// Scalars are overwritten; subjects are matched by name and updated in
/// place so existing result marks keep pointing at them.
fn update_course(conn: &Connection, id: i64, c: &CourseDraft) -> Result<(), ExecutionError> {
    let changed = conn.execute(
        "UPDATE courses SET short_code = ?, duration_months = ?, updated_at = ? WHERE id = ?",
        (
            required(&c.short_code, "short code")?,
            months(&c.duration_months)?,
            now_unix_string(),
            id,
        ),
    )?;
    if changed == 0 {
        return Err(ExecutionError::NotFound(format!("course {} no longer exists", id)));
    }
    let mut next_sort: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE course_id = ?",
        [id],
        |r| r.get(0),
    )?;
    for s in &c.subjects {
        let name = required(&s.name, "subject name")?;
        let subject_type = required(&s.subject_type, "subject type")?.to_ascii_lowercase();
        let updated = conn.execute(
            "UPDATE subjects SET subject_type = ?, te_max = ?, ce_max = ?, pe_max = ?, pw_max = ?
             WHERE course_id = ? AND name = ? COLLATE NOCASE",
            (
                &subject_type,
                number(&s.te),
                number(&s.ce),
                number(&s.pe),
                number(&s.pw),
                id,
                name,
            ),
        )?;
        if updated == 0 {
            insert_subject(conn, id, s, next_sort)?;
            next_sort += 1;
        }
    }
    Ok(())
}

fn insert_student(conn: &Connection, s: &StudentDraft) -> Result<i64, ExecutionError> {
    if let Some(email) = s.email.as_deref() {
        if exists(conn, "SELECT id FROM students WHERE email = ? COLLATE NOCASE", email)? {
            return Err(ExecutionError::Conflict(format!(
                "Student with email \"{}\" already exists",
                email
            )));
        }
    }
    conn.execute(
        "INSERT INTO students(name, email, phone, birth_date, course_id, batch_id, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            required(&s.name, "student name")?,
            &s.email,
            &s.phone,
            &s.birth_date,
            required_id(s.course_id, "course")?,
            required_id(s.batch_id, "batch")?,
            now_unix_string(),
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_student(conn: &Connection, id: i64, s: &StudentDraft) -> Result<(), ExecutionError> {
    let changed = conn.execute(
        "UPDATE students SET name = ?, email = ?, phone = ?, birth_date = ?, course_id = ?, batch_id = ?, updated_at = ?
         WHERE id = ?",
        (
            required(&s.name, "student name")?,
            &s.email,
            &s.phone,
            &s.birth_date,
            required_id(s.course_id, "course")?,
            required_id(s.batch_id, "batch")?,
            now_unix_string(),
            id,
        ),
    )?;
    if changed == 0 {
        return Err(ExecutionError::NotFound(format!("student {} no longer exists", id)));
    }
    Ok(())
}

fn published_flag(r: &ResultDraft) -> i64 {
    match r.is_published.as_deref().and_then(parse_boolish) {
        Some(true) => 1,
        _ => 0,
    }
}

fn insert_marks(conn: &Connection, result_id: i64, r: &ResultDraft) -> Result<(), ExecutionError> {
    for m in &r.marks {
        conn.execute(
            "INSERT INTO result_marks(result_id, subject_id, te, ce, pe, pw) VALUES(?, ?, ?, ?, ?, ?)",
            (
                result_id,
                required_id(m.subject_id, "subject")?,
                number(&m.te),
                number(&m.ce),
                number(&m.pe),
                number(&m.pw),
            ),
        )?;
    }
    Ok(())
}

fn insert_result(conn: &Connection, r: &ResultDraft) -> Result<i64, ExecutionError> {
    let register_no = required(&r.register_no, "register number")?;
    let student_id = required_id(r.student_id, "student")?;
    let course_id = required_id(r.course_id, "course")?;
    if exists(
        conn,
        "SELECT id FROM results WHERE register_no = ? COLLATE NOCASE",
        register_no,
    )? {
        return Err(ExecutionError::Conflict(format!(
            "Register number \"{}\" already exists",
            register_no
        )));
    }
    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT id FROM results WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            |row| row.get(0),
        )
        .optional()?;
    if duplicate.is_some() {
        return Err(ExecutionError::Conflict(
            "student already has a result for this course".to_string(),
        ));
    }
    conn.execute(
        "INSERT INTO results(student_id, course_id, batch_id, register_no, certificate_no, result, is_published, published_date, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            student_id,
            course_id,
            required_id(r.batch_id, "batch")?,
            register_no,
            &r.certificate_no,
            required(&r.result, "result")?,
            published_flag(r),
            &r.published_date,
            now_unix_string(),
        ),
    )?;
    let result_id = conn.last_insert_rowid();
    insert_marks(conn, result_id, r)?;
    Ok(result_id)
}

/// Marks are replaced wholesale by the imported set.
fn update_result(conn: &Connection, id: i64, r: &ResultDraft) -> Result<(), ExecutionError> {
    let changed = conn.execute(
        "UPDATE results SET student_id = ?, course_id = ?, batch_id = ?, certificate_no = ?, result = ?, is_published = ?, published_date = ?, updated_at = ?
         WHERE id = ?",
        (
            required_id(r.student_id, "student")?,
            required_id(r.course_id, "course")?,
            required_id(r.batch_id, "batch")?,
            &r.certificate_no,
            required(&r.result, "result")?,
            published_flag(r),
            &r.published_date,
            now_unix_string(),
            id,
        ),
    )?;
    if changed == 0 {
        return Err(ExecutionError::NotFound(format!("result {} no longer exists", id)));
    }
    conn.execute("DELETE FROM result_marks WHERE result_id = ?", [id])?;
    insert_marks(conn, id, r)
}

/// Deletes one record. Records still referenced elsewhere are refused.
pub fn delete_record(conn: &Connection, kind: EntityKind, id: i64) -> Result<(), ExecutionError> {
    let (table, blockers): (&str, &[(&str, &str)]) = match kind {
        EntityKind::Course => (
            "courses",
            &[
                ("SELECT COUNT(*) FROM batches WHERE course_id = ?", "batches"),
                ("SELECT COUNT(*) FROM students WHERE course_id = ?", "students"),
                ("SELECT COUNT(*) FROM results WHERE course_id = ?", "results"),
            ],
        ),
        EntityKind::Batch => (
            "batches",
            &[
                ("SELECT COUNT(*) FROM students WHERE batch_id = ?", "students"),
                ("SELECT COUNT(*) FROM results WHERE batch_id = ?", "results"),
            ],
        ),
        EntityKind::Student => (
            "students",
            &[("SELECT COUNT(*) FROM results WHERE student_id = ?", "results")],
        ),
        EntityKind::Result => ("results", &[]),
    };
    for (sql, what) in blockers {
        let n: i64 = conn.query_row(sql, [id], |r| r.get(0))?;
        if n > 0 {
            return Err(ExecutionError::Conflict(format!(
                "{} {} is still referenced by {} {}",
                kind.as_str(),
                id,
                n,
                what
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    match kind {
        EntityKind::Course => {
            tx.execute("DELETE FROM subjects WHERE course_id = ?", [id])?;
        }
        EntityKind::Result => {
            tx.execute("DELETE FROM result_marks WHERE result_id = ?", [id])?;
        }
        EntityKind::Batch | EntityKind::Student => {}
    }
    let changed = tx.execute(&format!("DELETE FROM {} WHERE id = ?", table), [id])?;
    if changed == 0 {
        return Err(ExecutionError::NotFound(format!(
            "{} {} not found",
            kind.as_str(),
            id
        )));
    }
    tx.commit()?;
    Ok(())
}
