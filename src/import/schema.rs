use super::record::CandidateRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Batch,
    Course,
    Student,
    Result,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" | "batches" => Some(Self::Batch),
            "course" | "courses" => Some(Self::Course),
            "student" | "students" => Some(Self::Student),
            "result" | "results" => Some(Self::Result),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Course => "course",
            Self::Student => "student",
            Self::Result => "result",
        }
    }

    pub fn schema(self) -> &'static Schema {
        match self {
            Self::Batch => &BATCH_SCHEMA,
            Self::Course => &COURSE_SCHEMA,
            Self::Student => &STUDENT_SCHEMA,
            Self::Result => &RESULT_SCHEMA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Create,
    Update,
}

impl ImportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Repeating trailing column block (a course's subjects, a result's marks).
#[derive(Debug)]
pub struct SubGroupLayout {
    pub width: usize,
    pub columns: &'static [&'static str],
}

/// Fixed column layout and key metadata for one entity kind. The pipeline
/// is written once; each kind only supplies one of these.
pub struct Schema {
    pub kind: EntityKind,
    pub noun: &'static str,
    pub columns: &'static [&'static str],
    pub sub_group: Option<SubGroupLayout>,
    /// Scalar columns that may not be blank, with the label used in the
    /// "is required" message.
    pub required: &'static [(usize, &'static str)],
    pub natural_keys: &'static [&'static str],
    /// Values of `natural_keys` for one record, position for position.
    /// A `None` value takes no part in duplicate detection.
    pub key_values: fn(&CandidateRecord) -> Vec<Option<&str>>,
}

impl Schema {
    /// Column index where the first sub-group block starts.
    pub fn sub_group_start(&self) -> usize {
        self.columns.len()
    }

    /// Header row for a downloadable template with `groups` sub-group blocks.
    pub fn template_header(&self, groups: usize) -> Vec<String> {
        let mut out: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        if let Some(sub) = &self.sub_group {
            for n in 1..=groups {
                for c in sub.columns {
                    out.push(format!("{} {}", c, n));
                }
            }
        }
        out
    }
}

pub static BATCH_SCHEMA: Schema = Schema {
    kind: EntityKind::Batch,
    noun: "batch",
    columns: &["Batch Name", "Start Date", "Duration (Months)", "Course"],
    sub_group: None,
    required: &[
        (0, "Batch name"),
        (1, "Start date"),
        (2, "Duration (months)"),
        (3, "Course"),
    ],
    natural_keys: &["batch name"],
    key_values: batch_key_values,
};

pub static COURSE_SCHEMA: Schema = Schema {
    kind: EntityKind::Course,
    noun: "course",
    columns: &["Course Name", "Short Code", "Duration (Months)"],
    sub_group: Some(SubGroupLayout {
        width: 6,
        columns: &["Subject", "Type", "TE Max", "CE Max", "PE Max", "PW Max"],
    }),
    required: &[(0, "Course name"), (1, "Short code"), (2, "Duration (months)")],
    natural_keys: &["course name", "short code"],
    key_values: course_key_values,
};

pub static STUDENT_SCHEMA: Schema = Schema {
    kind: EntityKind::Student,
    noun: "student",
    columns: &[
        "Student Name",
        "Email",
        "Phone",
        "Date of Birth",
        "Course",
        "Batch",
    ],
    sub_group: None,
    required: &[(0, "Student name"), (4, "Course"), (5, "Batch")],
    natural_keys: &["email", "student name"],
    key_values: student_key_values,
};

pub static RESULT_SCHEMA: Schema = Schema {
    kind: EntityKind::Result,
    noun: "result",
    columns: &[
        "Student Name",
        "Course Name",
        "Batch Name",
        "Register Number",
        "Certificate Number",
        "Result",
        "Is Published",
        "Published Date",
    ],
    sub_group: Some(SubGroupLayout {
        width: 6,
        columns: &[
            "Subject",
            "Type",
            "TE Obtained",
            "CE Obtained",
            "PE Obtained",
            "PW Obtained",
        ],
    }),
    required: &[
        (0, "Student name"),
        (1, "Course name"),
        (2, "Batch name"),
        (3, "Register number"),
        (5, "Result"),
    ],
    natural_keys: &["register number"],
    key_values: result_key_values,
};

fn batch_key_values(record: &CandidateRecord) -> Vec<Option<&str>> {
    match record {
        CandidateRecord::Batch(b) => vec![b.name.as_deref()],
        _ => Vec::new(),
    }
}

fn course_key_values(record: &CandidateRecord) -> Vec<Option<&str>> {
    match record {
        CandidateRecord::Course(c) => vec![c.name.as_deref(), c.short_code.as_deref()],
        _ => Vec::new(),
    }
}

// Email identifies a student when present; the name is the fallback.
fn student_key_values(record: &CandidateRecord) -> Vec<Option<&str>> {
    match record {
        CandidateRecord::Student(s) => match s.email.as_deref() {
            Some(email) => vec![Some(email), None],
            None => vec![None, s.name.as_deref()],
        },
        _ => Vec::new(),
    }
}

fn result_key_values(record: &CandidateRecord) -> Vec<Option<&str>> {
    match record {
        CandidateRecord::Result(r) => vec![r.register_no.as_deref()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn course_template_repeats_subject_block() {
        let header = COURSE_SCHEMA.template_header(2);
        assert_eq!(header.len(), 3 + 12);
        assert_eq!(header[3], "Subject 1");
        assert_eq!(header[8], "PW Max 1");
        assert_eq!(header[9], "Subject 2");
    }

    #[test]
    fn batch_template_ignores_group_count() {
        assert_eq!(BATCH_SCHEMA.template_header(5).len(), 4);
    }

    #[test]
    fn required_columns_point_inside_the_layout() {
        for schema in [&BATCH_SCHEMA, &COURSE_SCHEMA, &STUDENT_SCHEMA, &RESULT_SCHEMA] {
            for (col, _) in schema.required {
                assert!(*col < schema.columns.len(), "{} column {}", schema.noun, col);
            }
        }
    }

    #[test]
    fn student_key_falls_back_to_name_without_email() {
        let named = CandidateRecord::Student(crate::import::record::StudentDraft {
            name: Some("Asha".into()),
            ..Default::default()
        });
        assert_eq!((STUDENT_SCHEMA.key_values)(&named), vec![None, Some("Asha")]);
        let mailed = CandidateRecord::Student(crate::import::record::StudentDraft {
            name: Some("Asha".into()),
            email: Some("a@x.org".into()),
            ..Default::default()
        });
        assert_eq!((STUDENT_SCHEMA.key_values)(&mailed), vec![Some("a@x.org"), None]);
        assert!((STUDENT_SCHEMA.key_values)(&CandidateRecord::Batch(Default::default())).is_empty());
    }

    #[test]
    fn kind_parse_accepts_plural() {
        assert_eq!(EntityKind::parse("Results"), Some(EntityKind::Result));
        assert_eq!(EntityKind::parse("staff"), None);
    }
}
