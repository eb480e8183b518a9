//! Rule validator. Runs over the whole batch so cross-row duplicates can be
//! detected; every rule accumulates into the row's ordered issue list.

use super::error::RowIssue;
use super::record::{
    parse_boolish, parse_number, BatchDraft, CandidateRecord, CourseDraft, ResultDraft,
    StudentDraft, SubRecord, SubjectType,
};
use super::reference::{normalize_key, ReferenceIndex, SubjectRef};
use super::schema::ImportMode;
use chrono::{Datelike, NaiveDate};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub mode: ImportMode,
    pub today: NaiveDate,
    pub min_year: i32,
    pub future_years: i32,
}

impl ValidationContext {
    pub fn max_year(&self) -> i32 {
        self.today.year() + self.future_years
    }
}

/// A mapped and resolved row waiting for validation.
#[derive(Debug, Clone)]
pub struct ResolvedRow {
    pub row: usize,
    pub record: CandidateRecord,
    pub issues: Vec<RowIssue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowValidation {
    pub row: usize,
    pub record: CandidateRecord,
    pub errors: Vec<RowIssue>,
}

impl RowValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.message.as_str()).collect()
    }
}

pub fn validate(
    rows: Vec<ResolvedRow>,
    index: &ReferenceIndex,
    ctx: &ValidationContext,
) -> Vec<RowValidation> {
    let mut out: Vec<RowValidation> = rows
        .into_iter()
        .map(|r| {
            let ResolvedRow {
                row,
                mut record,
                mut issues,
            } = r;
            check_rules(&record, index, ctx, &mut issues);
            check_existing(&mut record, index, ctx.mode, &mut issues);
            RowValidation {
                row,
                record,
                errors: issues,
            }
        })
        .collect();
    flag_duplicates(&mut out);
    out
}

fn check_rules(
    record: &CandidateRecord,
    index: &ReferenceIndex,
    ctx: &ValidationContext,
    issues: &mut Vec<RowIssue>,
) {
    for (column, label) in record.kind().schema().required {
        if record.scalar(*column).is_none() {
            issues.push(RowIssue::validation(format!("{} is required", label)));
        }
    }
    match record {
        CandidateRecord::Batch(b) => check_batch(b, ctx, issues),
        CandidateRecord::Course(c) => check_course(c, issues),
        CandidateRecord::Student(s) => check_student(s, ctx, issues),
        CandidateRecord::Result(r) => check_result(r, index, ctx, issues),
    }
}

fn check_positive_months(value: &Option<String>, issues: &mut Vec<RowIssue>) {
    match parse_number(value.as_deref()) {
        Ok(None) => {}
        Ok(Some(n)) if n > 0.0 && n.fract() == 0.0 => {}
        _ => issues.push(RowIssue::validation(format!(
            "Duration \"{}\" must be a positive whole number of months",
            value.as_deref().unwrap_or_default()
        ))),
    }
}

/// Strict `YYYY-MM-DD`, a real calendar day, inside the configured year range.
pub fn check_date(label: &str, value: &str, ctx: &ValidationContext) -> Option<String> {
    let parts: Vec<&str> = value.split('-').collect();
    let shaped = parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()));
    if !shaped {
        return Some(format!(
            "{} \"{}\" is not a valid date (expected YYYY-MM-DD)",
            label, value
        ));
    }
    let (Ok(y), Ok(m), Ok(d)) = (
        parts[0].parse::<i32>(),
        parts[1].parse::<u32>(),
        parts[2].parse::<u32>(),
    ) else {
        return Some(format!("{} \"{}\" is not a valid date", label, value));
    };
    let Some(date) = NaiveDate::from_ymd_opt(y, m, d) else {
        return Some(format!("{} \"{}\" is an impossible date", label, value));
    };
    if date.format("%Y-%m-%d").to_string() != value {
        return Some(format!("{} \"{}\" is an impossible date", label, value));
    }
    if y < ctx.min_year || y > ctx.max_year() {
        return Some(format!(
            "{} \"{}\" must fall between {} and {}",
            label,
            value,
            ctx.min_year,
            ctx.max_year()
        ));
    }
    None
}

fn check_optional_date(
    value: &Option<String>,
    label: &str,
    ctx: &ValidationContext,
    issues: &mut Vec<RowIssue>,
) {
    if let Some(v) = value.as_deref() {
        if let Some(msg) = check_date(label, v, ctx) {
            issues.push(RowIssue::validation(msg));
        }
    }
}

fn check_batch(b: &BatchDraft, ctx: &ValidationContext, issues: &mut Vec<RowIssue>) {
    check_optional_date(&b.start_date, "Start date", ctx, issues);
    check_positive_months(&b.duration_months, issues);
}

fn check_course(c: &CourseDraft, issues: &mut Vec<RowIssue>) {
    check_positive_months(&c.duration_months, issues);
    if c.subjects.is_empty() {
        issues.push(RowIssue::validation("At least one subject is required"));
        return;
    }
    let mut seen = HashSet::new();
    for (i, s) in c.subjects.iter().enumerate() {
        check_sub_record(i, s, None, true, &mut seen, issues);
    }
}

fn check_student(s: &StudentDraft, ctx: &ValidationContext, issues: &mut Vec<RowIssue>) {
    if let Some(email) = s.email.as_deref() {
        if !looks_like_email(email) {
            issues.push(RowIssue::validation(format!(
                "Email \"{}\" is not a valid address",
                email
            )));
        }
    }
    if let Some(phone) = s.phone.as_deref() {
        let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
        let allowed = phone
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'));
        if !allowed || !(7..=15).contains(&digits) {
            issues.push(RowIssue::validation(format!(
                "Phone \"{}\" must contain 7 to 15 digits",
                phone
            )));
        }
    }
    check_optional_date(&s.birth_date, "Date of birth", ctx, issues);
}

fn looks_like_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !s.contains(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(a, b)| !a.is_empty() && !b.is_empty() && !b.ends_with('.'))
            .unwrap_or(false)
}

fn check_result(
    r: &ResultDraft,
    index: &ReferenceIndex,
    ctx: &ValidationContext,
    issues: &mut Vec<RowIssue>,
) {
    let published = match r.is_published.as_deref() {
        None => false,
        Some(v) => match parse_boolish(v) {
            Some(b) => b,
            None => {
                issues.push(RowIssue::validation(format!(
                    "Is Published \"{}\" must be yes or no",
                    v
                )));
                false
            }
        },
    };
    if published && r.published_date.is_none() {
        issues.push(RowIssue::validation(
            "Published date is required for a published result",
        ));
    }
    check_optional_date(&r.published_date, "Published date", ctx, issues);

    if r.marks.is_empty() {
        issues.push(RowIssue::validation("At least one subject mark is required"));
        return;
    }
    let mut seen = HashSet::new();
    for (i, m) in r.marks.iter().enumerate() {
        let limits = m.subject_id.and_then(|id| index.subject_by_id(id));
        check_sub_record(i, m, limits, false, &mut seen, issues);
    }
}

/// Shared rules for subject blocks. `maxima` selects the course-subject
/// reading (values are maxima, strictly positive) over the result reading
/// (obtained marks, non-negative and capped by `limits`).
fn check_sub_record(
    position: usize,
    s: &SubRecord,
    limits: Option<&SubjectRef>,
    maxima: bool,
    seen: &mut HashSet<String>,
    issues: &mut Vec<RowIssue>,
) {
    let name = s.name.as_deref().unwrap_or_default();
    let tag = format!("Subject {} \"{}\"", position + 1, name);

    if !seen.insert(normalize_key(name)) {
        issues.push(RowIssue::validation(format!("{}: listed more than once", tag)));
    }

    let declared = match s.subject_type.as_deref() {
        None => {
            issues.push(RowIssue::validation(format!("{}: type is required", tag)));
            None
        }
        Some(t) => match SubjectType::parse(t) {
            Some(t) => Some(t),
            None => {
                issues.push(RowIssue::validation(format!(
                    "{}: type \"{}\" must be theory or practical",
                    tag, t
                )));
                None
            }
        },
    };

    let fields = [
        ("TE", &s.te, limits.and_then(|l| l.te_max)),
        ("CE", &s.ce, limits.and_then(|l| l.ce_max)),
        ("PE", &s.pe, limits.and_then(|l| l.pe_max)),
        ("PW", &s.pw, limits.and_then(|l| l.pw_max)),
    ];
    for (label, value, max) in fields {
        match parse_number(value.as_deref()) {
            Ok(None) => {}
            Ok(Some(n)) if maxima && n <= 0.0 => issues.push(RowIssue::validation(format!(
                "{}: {} max must be greater than 0",
                tag, label
            ))),
            Ok(Some(n)) if !maxima && n < 0.0 => issues.push(RowIssue::validation(format!(
                "{}: {} mark cannot be negative",
                tag, label
            ))),
            Ok(Some(n)) => {
                if let Some(max) = max.filter(|_| !maxima) {
                    if n > max {
                        issues.push(RowIssue::validation(format!(
                            "{}: {} mark {} exceeds maximum {}",
                            tag, label, n, max
                        )));
                    }
                }
            }
            Err(bad) => issues.push(RowIssue::validation(format!(
                "{}: {} \"{}\" is not a number",
                tag, label, bad
            ))),
        }
    }

    match (s.has_theory(), s.has_practical()) {
        (true, true) => issues.push(RowIssue::validation(format!(
            "{}: cannot mix theory and practical marks",
            tag
        ))),
        (false, false) => issues.push(RowIssue::validation(format!(
            "{}: enter either theory (TE/CE) or practical (PE/PW) marks",
            tag
        ))),
        (true, false) if declared == Some(SubjectType::Practical) => {
            issues.push(RowIssue::validation(format!(
                "{}: type is practical but theory marks were given",
                tag
            )))
        }
        (false, true) if declared == Some(SubjectType::Theory) => {
            issues.push(RowIssue::validation(format!(
                "{}: type is theory but practical marks were given",
                tag
            )))
        }
        _ => {}
    }
}

/// Creation rejects natural keys that already exist; update requires them
/// and records the existing id as the update target.
fn check_existing(
    record: &mut CandidateRecord,
    index: &ReferenceIndex,
    mode: ImportMode,
    issues: &mut Vec<RowIssue>,
) {
    match record {
        CandidateRecord::Batch(b) => {
            let Some(name) = b.name.as_deref() else {
                return;
            };
            let existing = index.batches_named(name);
            match mode {
                ImportMode::Create => {
                    if !existing.is_empty() {
                        issues.push(RowIssue::conflict(format!(
                            "Batch \"{}\" already exists",
                            name
                        )));
                    }
                }
                ImportMode::Update => {
                    let Some(first) = existing.first() else {
                        issues.push(RowIssue::conflict(format!(
                            "Batch \"{}\" does not exist",
                            name
                        )));
                        return;
                    };
                    // Updating never moves a batch to another course.
                    match b.course_id {
                        Some(course_id) if !existing.iter().any(|e| e.course_id == course_id) => {
                            let owner = index
                                .course_by_id(first.course_id)
                                .map(|c| c.name.as_str())
                                .unwrap_or("?");
                            issues.push(RowIssue::conflict(format!(
                                "Batch \"{}\" belongs to course \"{}\"",
                                name, owner
                            )));
                        }
                        Some(course_id) => {
                            b.target_id = existing
                                .iter()
                                .find(|e| e.course_id == course_id)
                                .map(|e| e.id);
                        }
                        None => b.target_id = Some(first.id),
                    }
                }
            }
        }
        CandidateRecord::Course(c) => match mode {
            ImportMode::Create => {
                if let Some(name) = c.name.as_deref() {
                    if index.course_by_name(name).is_some() {
                        issues.push(RowIssue::conflict(format!(
                            "Course \"{}\" already exists",
                            name
                        )));
                    }
                }
                if let Some(code) = c.short_code.as_deref() {
                    if let Some(owner) = index.course_by_code(code) {
                        issues.push(RowIssue::conflict(format!(
                            "Short code \"{}\" is already used by course \"{}\"",
                            code, owner.name
                        )));
                    }
                }
            }
            ImportMode::Update => {
                let Some(name) = c.name.as_deref() else {
                    return;
                };
                match index.course_by_name(name) {
                    Some(existing) => {
                        if let Some(code) = c.short_code.as_deref() {
                            if let Some(owner) = index.course_by_code(code) {
                                if owner.id != existing.id {
                                    issues.push(RowIssue::conflict(format!(
                                        "Short code \"{}\" is already used by course \"{}\"",
                                        code, owner.name
                                    )));
                                }
                            }
                        }
                        c.target_id = Some(existing.id);
                    }
                    None => issues.push(RowIssue::conflict(format!(
                        "Course \"{}\" does not exist",
                        name
                    ))),
                }
            }
        },
        CandidateRecord::Student(s) => {
            let by_email = s.email.as_deref().map(|e| (e, index.student_by_email(e)));
            match (mode, by_email) {
                (ImportMode::Create, Some((email, Some(_)))) => {
                    issues.push(RowIssue::conflict(format!(
                        "Student with email \"{}\" already exists",
                        email
                    )))
                }
                (ImportMode::Create, Some((_, None))) => {}
                (ImportMode::Create, None) => {
                    if let Some(name) = s.name.as_deref() {
                        if !index.students_named(name).is_empty() {
                            issues.push(RowIssue::conflict(format!(
                                "Student \"{}\" already exists",
                                name
                            )));
                        }
                    }
                }
                (ImportMode::Update, Some((email, found))) => match found {
                    Some(existing) => s.target_id = Some(existing.id),
                    None => issues.push(RowIssue::conflict(format!(
                        "Student with email \"{}\" does not exist",
                        email
                    ))),
                },
                (ImportMode::Update, None) => {
                    let Some(name) = s.name.as_deref() else {
                        return;
                    };
                    match index.students_named(name).as_slice() {
                        [] => issues.push(RowIssue::conflict(format!(
                            "Student \"{}\" does not exist",
                            name
                        ))),
                        [one] => s.target_id = Some(one.id),
                        many => issues.push(RowIssue::conflict(format!(
                            "Student \"{}\" matches {} students; add an email to pick one",
                            name,
                            many.len()
                        ))),
                    }
                }
            }
        }
        CandidateRecord::Result(r) => {
            let existing = r
                .register_no
                .as_deref()
                .and_then(|reg| index.result_by_register(reg));
            match mode {
                ImportMode::Create => {
                    if let (Some(reg), Some(_)) = (r.register_no.as_deref(), existing) {
                        issues.push(RowIssue::conflict(format!(
                            "Register number \"{}\" already exists",
                            reg
                        )));
                    }
                    if let (Some(student_id), Some(course_id)) = (r.student_id, r.course_id) {
                        if index.result_for(student_id, course_id).is_some() {
                            issues.push(RowIssue::conflict(format!(
                                "Student \"{}\" already has a result for course \"{}\"",
                                r.student.as_deref().unwrap_or_default(),
                                r.course.as_deref().unwrap_or_default()
                            )));
                        }
                    }
                }
                ImportMode::Update => {
                    let Some(reg) = r.register_no.as_deref() else {
                        return;
                    };
                    match existing {
                        Some(e) => {
                            if r.student_id.is_some_and(|sid| sid != e.student_id) {
                                issues.push(RowIssue::conflict(format!(
                                    "Register number \"{}\" belongs to another student",
                                    reg
                                )));
                            }
                            r.target_id = Some(e.id);
                        }
                        None => issues.push(RowIssue::conflict(format!(
                            "Register number \"{}\" does not exist",
                            reg
                        ))),
                    }
                }
            }
        }
    }
}

fn natural_keys(record: &CandidateRecord) -> Vec<(&'static str, &str)> {
    let schema = record.kind().schema();
    schema
        .natural_keys
        .iter()
        .copied()
        .zip((schema.key_values)(record))
        .filter_map(|(label, value)| value.map(|v| (label, v)))
        .collect()
}

/// Both sides of a duplicate are flagged, each citing the other rows.
fn flag_duplicates(rows: &mut [RowValidation]) {
    let mut groups: HashMap<(&'static str, String), Vec<usize>> = HashMap::new();
    let mut per_row: Vec<Vec<(&'static str, String, String)>> = Vec::with_capacity(rows.len());
    for (pos, r) in rows.iter().enumerate() {
        let keys: Vec<_> = natural_keys(&r.record)
            .into_iter()
            .map(|(label, v)| (label, normalize_key(v), v.to_string()))
            .collect();
        for (label, norm, _) in &keys {
            groups.entry((*label, norm.clone())).or_default().push(pos);
        }
        per_row.push(keys);
    }

    for (pos, keys) in per_row.into_iter().enumerate() {
        for (label, norm, original) in keys {
            let Some(members) = groups.get(&(label, norm)) else {
                continue;
            };
            if members.len() < 2 {
                continue;
            }
            let others: Vec<String> = members
                .iter()
                .filter(|&&p| p != pos)
                .map(|&p| rows[p].row.to_string())
                .collect();
            let cite = if others.len() == 1 {
                format!("row {}", others[0])
            } else {
                format!("rows {}", others.join(", "))
            };
            rows[pos].errors.push(RowIssue::duplicate(format!(
                "Duplicate {} \"{}\" (also in {})",
                label, original, cite
            )));
        }
    }
}
