//! Record mapper: fixed column positions per entity kind, never header names.
//! Mapping never fails; missing cells become `None` and are left for the
//! validator to judge.

use super::parser::{excel_serial_to_date, Cell, RawRow};
use super::record::{
    BatchDraft, CandidateRecord, CourseDraft, ResultDraft, StudentDraft, SubRecord,
};
use super::schema::EntityKind;

pub fn map_row(kind: EntityKind, row: &RawRow) -> CandidateRecord {
    let cells = row.cells.as_slice();
    match kind {
        EntityKind::Batch => CandidateRecord::Batch(BatchDraft {
            name: text_at(cells, 0),
            start_date: date_at(cells, 1),
            duration_months: text_at(cells, 2),
            course: text_at(cells, 3),
            ..Default::default()
        }),
        EntityKind::Course => CandidateRecord::Course(CourseDraft {
            name: text_at(cells, 0),
            short_code: text_at(cells, 1),
            duration_months: text_at(cells, 2),
            subjects: sub_records(kind, cells),
            ..Default::default()
        }),
        EntityKind::Student => CandidateRecord::Student(StudentDraft {
            name: text_at(cells, 0),
            email: text_at(cells, 1),
            phone: text_at(cells, 2),
            birth_date: date_at(cells, 3),
            course: text_at(cells, 4),
            batch: text_at(cells, 5),
            ..Default::default()
        }),
        EntityKind::Result => CandidateRecord::Result(ResultDraft {
            student: text_at(cells, 0),
            course: text_at(cells, 1),
            batch: text_at(cells, 2),
            register_no: text_at(cells, 3),
            certificate_no: text_at(cells, 4),
            result: text_at(cells, 5),
            is_published: text_at(cells, 6),
            published_date: date_at(cells, 7),
            marks: sub_records(kind, cells),
            ..Default::default()
        }),
    }
}

/// Reads sub-group blocks greedily until a block's first column is blank.
fn sub_records(kind: EntityKind, cells: &[Cell]) -> Vec<SubRecord> {
    let schema = kind.schema();
    let Some(layout) = &schema.sub_group else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut start = schema.sub_group_start();
    while let Some(name) = text_at(cells, start) {
        out.push(SubRecord {
            name: Some(name),
            subject_type: text_at(cells, start + 1),
            te: text_at(cells, start + 2),
            ce: text_at(cells, start + 3),
            pe: text_at(cells, start + 4),
            pw: text_at(cells, start + 5),
            subject_id: None,
        });
        start += layout.width;
    }
    out
}

fn text_at(cells: &[Cell], idx: usize) -> Option<String> {
    match cells.get(idx)? {
        Cell::Empty => None,
        Cell::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Cell::Number(n) => Some(format_number(*n)),
    }
}

/// Date columns accept a raw spreadsheet serial as well as text.
fn date_at(cells: &[Cell], idx: usize) -> Option<String> {
    match cells.get(idx)? {
        Cell::Number(n) => excel_serial_to_date(*n).or_else(|| Some(format_number(*n))),
        _ => text_at(cells, idx),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> RawRow {
        RawRow {
            row: 2,
            cells: cells
                .iter()
                .map(|c| {
                    if c.is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(c.to_string())
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn course_subjects_read_until_blank_block() {
        let r = row(&[
            "Diploma", "DIP", "12", "Maths", "theory", "80", "20", "", "", "Lab", "practical", "",
            "", "60", "40", "", "ignored",
        ]);
        let CandidateRecord::Course(c) = map_row(EntityKind::Course, &r) else {
            panic!("expected course");
        };
        assert_eq!(c.subjects.len(), 2);
        assert_eq!(c.subjects[0].te.as_deref(), Some("80"));
        assert_eq!(c.subjects[0].pe, None);
        assert_eq!(c.subjects[1].name.as_deref(), Some("Lab"));
        assert_eq!(c.subjects[1].pw.as_deref(), Some("40"));
    }

    #[test]
    fn short_rows_map_to_none() {
        let CandidateRecord::Batch(b) = map_row(EntityKind::Batch, &row(&["Batch A"])) else {
            panic!("expected batch");
        };
        assert_eq!(b.name.as_deref(), Some("Batch A"));
        assert_eq!(b.start_date, None);
        assert_eq!(b.course, None);
    }

    #[test]
    fn numeric_cells_render_without_trailing_zero() {
        let r = RawRow {
            row: 2,
            cells: vec![
                Cell::Text("Batch A".into()),
                Cell::Number(45306.0),
                Cell::Number(12.0),
                Cell::Text("CS".into()),
            ],
        };
        let CandidateRecord::Batch(b) = map_row(EntityKind::Batch, &r) else {
            panic!("expected batch");
        };
        assert_eq!(b.start_date.as_deref(), Some("2024-01-15"));
        assert_eq!(b.duration_months.as_deref(), Some("12"));
    }

    #[test]
    fn result_marks_follow_scalar_columns() {
        let r = row(&[
            "Asha", "Diploma", "B1", "REG1", "C1", "Pass", "yes", "2024-05-01", "Maths", "theory",
            "70", "15", "", "",
        ]);
        let CandidateRecord::Result(res) = map_row(EntityKind::Result, &r) else {
            panic!("expected result");
        };
        assert_eq!(res.register_no.as_deref(), Some("REG1"));
        assert_eq!(res.marks.len(), 1);
        assert_eq!(res.marks[0].subject_type.as_deref(), Some("theory"));
        assert!(res.marks[0].has_theory());
        assert!(!res.marks[0].has_practical());
    }
}
