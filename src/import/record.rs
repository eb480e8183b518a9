//! Candidate records: typed drafts built from one raw row.
//!
//! Textual fields keep what the operator typed (trimmed, `None` when blank)
//! so errors can echo it. Identifier fields start empty and are filled in
//! by the resolver.

use super::schema::EntityKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Theory,
    Practical,
}

impl SubjectType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "theory" => Some(Self::Theory),
            "practical" => Some(Self::Practical),
            _ => None,
        }
    }
}

/// One fixed-width block of trailing columns: a course subject (maxima)
/// or a result mark line (obtained values).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRecord {
    pub name: Option<String>,
    pub subject_type: Option<String>,
    pub te: Option<String>,
    pub ce: Option<String>,
    pub pe: Option<String>,
    pub pw: Option<String>,
    pub subject_id: Option<i64>,
}

impl SubRecord {
    pub fn has_theory(&self) -> bool {
        self.te.is_some() || self.ce.is_some()
    }

    pub fn has_practical(&self) -> bool {
        self.pe.is_some() || self.pw.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDraft {
    pub name: Option<String>,
    pub start_date: Option<String>,
    pub duration_months: Option<String>,
    pub course: Option<String>,
    pub course_id: Option<i64>,
    pub target_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseDraft {
    pub name: Option<String>,
    pub short_code: Option<String>,
    pub duration_months: Option<String>,
    pub subjects: Vec<SubRecord>,
    pub target_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDraft {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birth_date: Option<String>,
    pub course: Option<String>,
    pub batch: Option<String>,
    pub course_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub target_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDraft {
    pub student: Option<String>,
    pub course: Option<String>,
    pub batch: Option<String>,
    pub register_no: Option<String>,
    pub certificate_no: Option<String>,
    pub result: Option<String>,
    pub is_published: Option<String>,
    pub published_date: Option<String>,
    pub marks: Vec<SubRecord>,
    pub student_id: Option<i64>,
    pub course_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub target_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateRecord {
    Batch(BatchDraft),
    Course(CourseDraft),
    Student(StudentDraft),
    Result(ResultDraft),
}

impl CandidateRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            CandidateRecord::Batch(_) => EntityKind::Batch,
            CandidateRecord::Course(_) => EntityKind::Course,
            CandidateRecord::Student(_) => EntityKind::Student,
            CandidateRecord::Result(_) => EntityKind::Result,
        }
    }

    /// Human-readable identity used in outcome failure lists.
    pub fn label(&self) -> String {
        let label = match self {
            CandidateRecord::Batch(b) => b.name.clone(),
            CandidateRecord::Course(c) => c.name.clone(),
            CandidateRecord::Student(s) => s.name.clone().or_else(|| s.email.clone()),
            CandidateRecord::Result(r) => r.register_no.clone(),
        };
        label.unwrap_or_else(|| "(unnamed)".to_string())
    }

    /// Text of a scalar column, by its position in the kind's layout.
    pub fn scalar(&self, column: usize) -> Option<&str> {
        let value = match (self, column) {
            (CandidateRecord::Batch(b), 0) => &b.name,
            (CandidateRecord::Batch(b), 1) => &b.start_date,
            (CandidateRecord::Batch(b), 2) => &b.duration_months,
            (CandidateRecord::Batch(b), 3) => &b.course,
            (CandidateRecord::Course(c), 0) => &c.name,
            (CandidateRecord::Course(c), 1) => &c.short_code,
            (CandidateRecord::Course(c), 2) => &c.duration_months,
            (CandidateRecord::Student(s), 0) => &s.name,
            (CandidateRecord::Student(s), 1) => &s.email,
            (CandidateRecord::Student(s), 2) => &s.phone,
            (CandidateRecord::Student(s), 3) => &s.birth_date,
            (CandidateRecord::Student(s), 4) => &s.course,
            (CandidateRecord::Student(s), 5) => &s.batch,
            (CandidateRecord::Result(r), 0) => &r.student,
            (CandidateRecord::Result(r), 1) => &r.course,
            (CandidateRecord::Result(r), 2) => &r.batch,
            (CandidateRecord::Result(r), 3) => &r.register_no,
            (CandidateRecord::Result(r), 4) => &r.certificate_no,
            (CandidateRecord::Result(r), 5) => &r.result,
            (CandidateRecord::Result(r), 6) => &r.is_published,
            (CandidateRecord::Result(r), 7) => &r.published_date,
            _ => return None,
        };
        value.as_deref()
    }

    pub fn target_id(&self) -> Option<i64> {
        match self {
            CandidateRecord::Batch(b) => b.target_id,
            CandidateRecord::Course(c) => c.target_id,
            CandidateRecord::Student(s) => s.target_id,
            CandidateRecord::Result(r) => r.target_id,
        }
    }
}

/// Parses a trimmed numeric cell; `None` when absent, `Err` echoes the bad text.
pub fn parse_number(v: Option<&str>) -> Result<Option<f64>, String> {
    match v {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| s.to_string()),
    }
}

pub fn parse_boolish(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}
