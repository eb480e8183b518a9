//! One import dialog session: references are fetched when it opens, files
//! are loaded (and may be re-loaded after fixes), and executing consumes
//! the session so its in-memory rows are discarded afterwards.

use super::error::{ExecutionError, ParseError};
use super::events::{EventSink, ImportEvent};
use super::execute::{execute, ExecutionOutcome, ExecutorConfig};
use super::mapper::map_row;
use super::parser::{parse_grid, RawGrid, SourceFormat};
use super::reference::{resolve, ReferenceIndex};
use super::schema::{EntityKind, ImportMode};
use super::validate::{validate, ResolvedRow, RowValidation, ValidationContext};
use crate::backend::Backend;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no file has been loaded into this import session")]
    NotLoaded,
}

/// Maps, resolves and validates every data row of `grid`.
pub fn prepare_rows(
    kind: EntityKind,
    grid: &RawGrid,
    index: &ReferenceIndex,
    ctx: &ValidationContext,
) -> Vec<RowValidation> {
    let resolved = grid
        .rows
        .iter()
        .map(|raw| {
            let mut record = map_row(kind, raw);
            let issues = resolve(&mut record, index);
            ResolvedRow {
                row: raw.row,
                record,
                issues,
            }
        })
        .collect();
    validate(resolved, index, ctx)
}

pub struct ImportSession {
    pub id: String,
    pub kind: EntityKind,
    pub mode: ImportMode,
    index: ReferenceIndex,
    rows: Option<Vec<RowValidation>>,
}

impl ImportSession {
    pub fn open<B: Backend + ?Sized>(
        id: String,
        kind: EntityKind,
        mode: ImportMode,
        backend: &B,
    ) -> Result<Self, ExecutionError> {
        let refs = backend.fetch_references()?;
        let index = ReferenceIndex::build(refs);
        info!(session = %id, kind = kind.as_str(), mode = mode.as_str(), "import session opened");
        Ok(Self {
            id,
            kind,
            mode,
            index,
            rows: None,
        })
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn rows(&self) -> Option<&[RowValidation]> {
        self.rows.as_deref()
    }

    /// Parses and validates a file, replacing anything loaded before.
    pub fn load(
        &mut self,
        bytes: &[u8],
        format: SourceFormat,
        ctx: &ValidationContext,
        sink: &mut dyn EventSink,
    ) -> Result<&[RowValidation], ParseError> {
        self.rows = None;
        let grid = match parse_grid(bytes, format) {
            Ok(g) => g,
            Err(e) => {
                warn!(session = %self.id, error = %e, "import file could not be parsed");
                let _ = sink.emit(&ImportEvent::ParseFailed {
                    message: e.message.clone(),
                });
                return Err(e);
            }
        };
        let ctx = ValidationContext {
            mode: self.mode,
            ..ctx.clone()
        };
        let rows = prepare_rows(self.kind, &grid, &self.index, &ctx);
        debug!(session = %self.id, header_cells = grid.header.len(), "header row skipped");
        let valid = rows.iter().filter(|r| r.is_valid()).count();
        info!(
            session = %self.id,
            rows = rows.len(),
            valid,
            "import file validated"
        );
        let _ = sink.emit(&ImportEvent::ValidationComplete {
            rows_total: rows.len(),
            valid,
            invalid: rows.len() - valid,
        });
        Ok(self.rows.insert(rows).as_slice())
    }

    pub fn execute<B: Backend + Sync + ?Sized>(
        self,
        backend: &B,
        config: ExecutorConfig,
        sink: &mut dyn EventSink,
    ) -> Result<ExecutionOutcome, SessionError> {
        let rows = self.rows.ok_or(SessionError::NotLoaded)?;
        Ok(execute(backend, self.mode, &rows, config, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::events::EventLog;
    use crate::import::record::CandidateRecord;
    use crate::import::reference::{CourseRef, ReferenceCollections};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct MemoryBackend {
        refs: ReferenceCollections,
        submitted: Mutex<Vec<CandidateRecord>>,
    }

    impl Backend for MemoryBackend {
        fn fetch_references(&self) -> Result<ReferenceCollections, ExecutionError> {
            Ok(self.refs.clone())
        }

        fn submit(
            &self,
            _mode: ImportMode,
            record: &CandidateRecord,
        ) -> Result<Option<i64>, ExecutionError> {
            let mut submitted = self.submitted.lock().expect("lock");
            submitted.push(record.clone());
            Ok(Some(submitted.len() as i64))
        }
    }

    fn backend() -> MemoryBackend {
        MemoryBackend {
            refs: ReferenceCollections {
                courses: vec![CourseRef {
                    id: 7,
                    name: "Computer Science".into(),
                    short_code: Some("CS".into()),
                }],
                ..Default::default()
            },
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn ctx() -> ValidationContext {
        ValidationContext {
            mode: ImportMode::Create,
            today: NaiveDate::from_ymd_opt(2026, 10, 15).expect("date"),
            min_year: 1900,
            future_years: 10,
        }
    }

    #[test]
    fn load_then_execute_submits_resolved_valid_rows() {
        let backend = backend();
        let mut session =
            ImportSession::open("s1".into(), EntityKind::Batch, ImportMode::Create, &backend)
                .expect("open");
        let mut log = EventLog::default();
        let csv = b"Batch Name,Start Date,Duration,Course\nB1,2024-01-15,12,CS\nB2,2024-13-01,12,CS\n";
        let rows = session
            .load(csv, SourceFormat::Csv, &ctx(), &mut log)
            .expect("load");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_valid());
        assert!(!rows[1].is_valid());
        assert!(matches!(
            log.events[0],
            ImportEvent::ValidationComplete {
                rows_total: 2,
                valid: 1,
                invalid: 1
            }
        ));

        let out = session
            .execute(&backend, ExecutorConfig::default(), &mut log)
            .expect("execute");
        assert_eq!(out.success, 1);
        let submitted = backend.submitted.lock().expect("lock");
        let CandidateRecord::Batch(b) = &submitted[0] else {
            panic!("expected batch");
        };
        assert_eq!(b.course_id, Some(7));
    }

    #[test]
    fn parse_failure_is_reported_once_and_clears_rows() {
        let backend = backend();
        let mut session =
            ImportSession::open("s2".into(), EntityKind::Course, ImportMode::Create, &backend)
                .expect("open");
        let mut log = EventLog::default();
        session
            .load(b"h\nA,B,1,S,theory,1,,,\n", SourceFormat::Csv, &ctx(), &mut log)
            .expect("first load");
        assert!(session.load(b"", SourceFormat::Csv, &ctx(), &mut log).is_err());
        assert!(session.rows().is_none());
        assert!(matches!(log.events.last(), Some(ImportEvent::ParseFailed { .. })));
        assert!(matches!(
            session.execute(&backend, ExecutorConfig::default(), &mut log),
            Err(SessionError::NotLoaded)
        ));
    }
}
