//! Reference collections fetched from the backend, the case-insensitive
//! name index built over them, and the resolver that annotates candidate
//! records with backend identifiers.

use super::error::RowIssue;
use super::record::{BatchDraft, CandidateRecord, ResultDraft, StudentDraft};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub short_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
    #[serde(default)]
    pub subject_type: Option<String>,
    #[serde(default)]
    pub te_max: Option<f64>,
    #[serde(default)]
    pub ce_max: Option<f64>,
    #[serde(default)]
    pub pe_max: Option<f64>,
    #[serde(default)]
    pub pw_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRef {
    pub id: i64,
    pub name: String,
    pub course_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    pub batch_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRef {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub register_no: String,
}

/// Everything the engine needs from the backend before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCollections {
    #[serde(default)]
    pub courses: Vec<CourseRef>,
    #[serde(default)]
    pub subjects: Vec<SubjectRef>,
    #[serde(default)]
    pub batches: Vec<BatchRef>,
    #[serde(default)]
    pub students: Vec<StudentRef>,
    #[serde(default)]
    pub results: Vec<ResultRef>,
}

pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Read-only lookup tables for one import session.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    data: ReferenceCollections,
    course_by_name: HashMap<String, usize>,
    course_by_code: HashMap<String, usize>,
    course_by_id: HashMap<i64, usize>,
    batch_by_name: HashMap<String, Vec<usize>>,
    subject_by_course: HashMap<(i64, String), usize>,
    subject_by_id: HashMap<i64, usize>,
    student_by_name: HashMap<String, Vec<usize>>,
    student_by_email: HashMap<String, usize>,
    result_by_register: HashMap<String, usize>,
    result_by_pair: HashMap<(i64, i64), usize>,
}

impl ReferenceIndex {
    pub fn build(data: ReferenceCollections) -> Self {
        let mut idx = ReferenceIndex::default();
        for (i, c) in data.courses.iter().enumerate() {
            idx.course_by_name.entry(normalize_key(&c.name)).or_insert(i);
            if let Some(code) = c.short_code.as_deref().filter(|s| !s.trim().is_empty()) {
                idx.course_by_code.entry(normalize_key(code)).or_insert(i);
            }
            idx.course_by_id.insert(c.id, i);
        }
        for (i, b) in data.batches.iter().enumerate() {
            idx.batch_by_name
                .entry(normalize_key(&b.name))
                .or_default()
                .push(i);
        }
        for (i, s) in data.subjects.iter().enumerate() {
            idx.subject_by_course
                .entry((s.course_id, normalize_key(&s.name)))
                .or_insert(i);
            idx.subject_by_id.insert(s.id, i);
        }
        for (i, s) in data.students.iter().enumerate() {
            idx.student_by_name
                .entry(normalize_key(&s.name))
                .or_default()
                .push(i);
            if let Some(email) = s.email.as_deref().filter(|e| !e.trim().is_empty()) {
                idx.student_by_email.entry(normalize_key(email)).or_insert(i);
            }
        }
        for (i, r) in data.results.iter().enumerate() {
            idx.result_by_register
                .entry(normalize_key(&r.register_no))
                .or_insert(i);
            idx.result_by_pair.entry((r.student_id, r.course_id)).or_insert(i);
        }
        idx.data = data;
        idx
    }

    pub fn counts(&self) -> serde_json::Value {
        serde_json::json!({
            "courses": self.data.courses.len(),
            "subjects": self.data.subjects.len(),
            "batches": self.data.batches.len(),
            "students": self.data.students.len(),
            "results": self.data.results.len(),
        })
    }

    pub fn course_by_name(&self, name: &str) -> Option<&CourseRef> {
        self.course_by_name
            .get(&normalize_key(name))
            .map(|&i| &self.data.courses[i])
    }

    pub fn course_by_code(&self, code: &str) -> Option<&CourseRef> {
        self.course_by_code
            .get(&normalize_key(code))
            .map(|&i| &self.data.courses[i])
    }

    /// Name first, then short code.
    pub fn course(&self, name_or_code: &str) -> Option<&CourseRef> {
        self.course_by_name(name_or_code)
            .or_else(|| self.course_by_code(name_or_code))
    }

    pub fn course_by_id(&self, id: i64) -> Option<&CourseRef> {
        self.course_by_id.get(&id).map(|&i| &self.data.courses[i])
    }

    pub fn batches_named(&self, name: &str) -> Vec<&BatchRef> {
        self.batch_by_name
            .get(&normalize_key(name))
            .map(|v| v.iter().map(|&i| &self.data.batches[i]).collect())
            .unwrap_or_default()
    }

    pub fn subject(&self, course_id: i64, name: &str) -> Option<&SubjectRef> {
        self.subject_by_course
            .get(&(course_id, normalize_key(name)))
            .map(|&i| &self.data.subjects[i])
    }

    pub fn subject_by_id(&self, id: i64) -> Option<&SubjectRef> {
        self.subject_by_id.get(&id).map(|&i| &self.data.subjects[i])
    }

    pub fn students_named(&self, name: &str) -> Vec<&StudentRef> {
        self.student_by_name
            .get(&normalize_key(name))
            .map(|v| v.iter().map(|&i| &self.data.students[i]).collect())
            .unwrap_or_default()
    }

    pub fn student_by_email(&self, email: &str) -> Option<&StudentRef> {
        self.student_by_email
            .get(&normalize_key(email))
            .map(|&i| &self.data.students[i])
    }

    pub fn result_by_register(&self, register_no: &str) -> Option<&ResultRef> {
        self.result_by_register
            .get(&normalize_key(register_no))
            .map(|&i| &self.data.results[i])
    }

    pub fn result_for(&self, student_id: i64, course_id: i64) -> Option<&ResultRef> {
        self.result_by_pair
            .get(&(student_id, course_id))
            .map(|&i| &self.data.results[i])
    }
}

/// Attaches backend identifiers to `record`, returning one issue per
/// reference that could not be resolved. Blank names are skipped; the
/// validator reports them as missing.
pub fn resolve(record: &mut CandidateRecord, index: &ReferenceIndex) -> Vec<RowIssue> {
    let mut issues = Vec::new();
    match record {
        CandidateRecord::Batch(b) => resolve_batch(b, index, &mut issues),
        CandidateRecord::Course(_) => {}
        CandidateRecord::Student(s) => resolve_student(s, index, &mut issues),
        CandidateRecord::Result(r) => resolve_result(r, index, &mut issues),
    }
    issues
}

fn resolve_course_name(
    name: Option<&str>,
    index: &ReferenceIndex,
    allow_code: bool,
    issues: &mut Vec<RowIssue>,
) -> Option<i64> {
    let name = name?;
    let found = if allow_code {
        index.course(name)
    } else {
        index.course_by_name(name)
    };
    match found {
        Some(c) => Some(c.id),
        None => {
            issues.push(RowIssue::resolution(format!("Course \"{}\" not found", name)));
            None
        }
    }
}

/// A batch resolves only when one with this name belongs to `course_id`.
fn resolve_batch_name(
    name: Option<&str>,
    course_id: i64,
    index: &ReferenceIndex,
    issues: &mut Vec<RowIssue>,
) -> Option<i64> {
    let name = name?;
    let candidates = index.batches_named(name);
    if candidates.is_empty() {
        issues.push(RowIssue::resolution(format!("Batch \"{}\" not found", name)));
        return None;
    }
    if let Some(b) = candidates.iter().find(|b| b.course_id == course_id) {
        return Some(b.id);
    }
    let course_name = index
        .course_by_id(course_id)
        .map(|c| c.name.as_str())
        .unwrap_or("?");
    issues.push(RowIssue::resolution(format!(
        "Batch \"{}\" does not belong to course \"{}\"",
        name, course_name
    )));
    None
}

fn resolve_batch(b: &mut BatchDraft, index: &ReferenceIndex, issues: &mut Vec<RowIssue>) {
    b.course_id = resolve_course_name(b.course.as_deref(), index, true, issues);
}

fn resolve_student(s: &mut StudentDraft, index: &ReferenceIndex, issues: &mut Vec<RowIssue>) {
    s.course_id = resolve_course_name(s.course.as_deref(), index, true, issues);
    if let Some(course_id) = s.course_id {
        s.batch_id = resolve_batch_name(s.batch.as_deref(), course_id, index, issues);
    }
}

fn resolve_result(r: &mut ResultDraft, index: &ReferenceIndex, issues: &mut Vec<RowIssue>) {
    r.course_id = resolve_course_name(r.course.as_deref(), index, false, issues);
    if let Some(course_id) = r.course_id {
        r.batch_id = resolve_batch_name(r.batch.as_deref(), course_id, index, issues);
    }

    if let Some(name) = r.student.as_deref() {
        let mut candidates = index.students_named(name);
        if candidates.len() > 1 {
            if let Some(batch_id) = r.batch_id {
                let narrowed: Vec<_> = candidates
                    .iter()
                    .copied()
                    .filter(|s| s.batch_id == Some(batch_id))
                    .collect();
                if !narrowed.is_empty() {
                    candidates = narrowed;
                }
            }
        }
        match candidates.as_slice() {
            [] => issues.push(RowIssue::resolution(format!(
                "Student \"{}\" not found",
                name
            ))),
            [one] => r.student_id = Some(one.id),
            many => issues.push(RowIssue::resolution(format!(
                "Student \"{}\" matches {} students",
                name,
                many.len()
            ))),
        }
    }

    let Some(course_id) = r.course_id else {
        return;
    };
    let course_name = r.course.clone().unwrap_or_default();
    for mark in r.marks.iter_mut() {
        let Some(subject) = mark.name.as_deref() else {
            continue;
        };
        match index.subject(course_id, subject) {
            Some(s) => mark.subject_id = Some(s.id),
            None => issues.push(RowIssue::resolution(format!(
                "Subject \"{}\" not found in course \"{}\"",
                subject, course_name
            ))),
        }
    }
}
