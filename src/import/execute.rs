//! Batch executor and outcome aggregation.
//!
//! Valid rows are submitted in original row order, at most `max_in_flight`
//! at a time (default 1, strictly sequential). A failed row is recorded and
//! the run continues. Progress is reported after every row.

use super::error::ExecutionError;
use super::events::{EventSink, ImportEvent};
use super::schema::ImportMode;
use super::validate::RowValidation;
use crate::backend::Backend;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub max_in_flight: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_in_flight: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub row: usize,
    pub label: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSuccess {
    pub row: usize,
    /// Absent when the backend accepted the row without echoing an id.
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<RowFailure>,
    pub saved: Vec<RowSuccess>,
    /// Set when the sink asked to stop before every valid row was attempted.
    pub interrupted: bool,
}

impl ExecutionOutcome {
    pub fn record(
        &mut self,
        row: usize,
        label: String,
        result: Result<Option<i64>, ExecutionError>,
    ) {
        match result {
            Ok(id) => {
                self.success += 1;
                self.saved.push(RowSuccess { row, id });
            }
            Err(e) => {
                self.failed += 1;
                self.errors.push(RowFailure {
                    row,
                    label,
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn attempted(&self) -> usize {
        self.success + self.failed
    }
}

pub fn progress_percent(attempted: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        attempted as f64 * 100.0 / total as f64
    }
}

pub fn execute<B>(
    backend: &B,
    mode: ImportMode,
    rows: &[RowValidation],
    config: ExecutorConfig,
    sink: &mut dyn EventSink,
) -> ExecutionOutcome
where
    B: Backend + Sync + ?Sized,
{
    let valid: Vec<&RowValidation> = rows.iter().filter(|r| r.is_valid()).collect();
    let total = valid.len();
    let width = config.max_in_flight.max(1);
    info!(total, max_in_flight = width, mode = mode.as_str(), "executing import");

    let mut outcome = ExecutionOutcome::default();
    for window in valid.chunks(width) {
        let results = submit_window(backend, mode, window);
        let mut stop = false;
        for (row, result) in window.iter().zip(results) {
            if let Err(e) = &result {
                warn!(row = row.row, error = %e, "row submission failed");
            }
            outcome.record(row.row, row.record.label(), result);
            let attempted = outcome.attempted();
            let percent = progress_percent(attempted, total);
            debug!(row = row.row, attempted, total, percent, "import progress");
            let event = ImportEvent::ExecutionProgress {
                row: row.row,
                attempted,
                total,
                percent,
            };
            if sink.emit(&event).is_break() {
                stop = true;
            }
        }
        if stop && outcome.attempted() < total {
            info!(attempted = outcome.attempted(), total, "import stopped by caller");
            outcome.interrupted = true;
            break;
        }
    }

    info!(
        success = outcome.success,
        failed = outcome.failed,
        "import execution complete"
    );
    let _ = sink.emit(&ImportEvent::ExecutionComplete {
        outcome: outcome.clone(),
    });
    outcome
}

fn submit_window<B>(
    backend: &B,
    mode: ImportMode,
    window: &[&RowValidation],
) -> Vec<Result<Option<i64>, ExecutionError>>
where
    B: Backend + Sync + ?Sized,
{
    if window.len() == 1 {
        return window
            .iter()
            .map(|r| backend.submit(mode, &r.record))
            .collect();
    }
    std::thread::scope(|scope| {
        let handles: Vec<_> = window
            .iter()
            .map(|r| scope.spawn(move || backend.submit(mode, &r.record)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(ExecutionError::Transport(
                        "submission thread panicked".to_string(),
                    ))
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::error::RowIssue;
    use crate::import::events::EventLog;
    use crate::import::record::{BatchDraft, CandidateRecord};
    use crate::import::reference::ReferenceCollections;
    use std::ops::ControlFlow;
    use std::sync::Mutex;

    /// Records submitted labels; rejects the ones listed in `reject`.
    struct ScriptedBackend {
        reject: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(reject: Vec<&'static str>) -> Self {
            Self {
                reject,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    impl Backend for ScriptedBackend {
        fn fetch_references(&self) -> Result<ReferenceCollections, ExecutionError> {
            Ok(ReferenceCollections::default())
        }

        fn submit(
            &self,
            _mode: ImportMode,
            record: &CandidateRecord,
        ) -> Result<Option<i64>, ExecutionError> {
            let label = record.label();
            self.calls.lock().expect("calls lock").push(label.clone());
            if self.reject.contains(&label.as_str()) {
                return Err(ExecutionError::Rejected {
                    status: 400,
                    message: format!("{} rejected", label),
                });
            }
            Ok(Some(label.len() as i64))
        }
    }

    fn row(n: usize, name: &str, valid: bool) -> RowValidation {
        RowValidation {
            row: n,
            record: CandidateRecord::Batch(BatchDraft {
                name: Some(name.to_string()),
                ..Default::default()
            }),
            errors: if valid {
                Vec::new()
            } else {
                vec![RowIssue::validation("bad")]
            },
        }
    }

    fn progress(log: &EventLog) -> Vec<f64> {
        log.events
            .iter()
            .filter_map(|e| match e {
                ImportEvent::ExecutionProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn failure_in_the_middle_does_not_stop_the_batch() {
        let backend = ScriptedBackend::new(vec!["b2"]);
        let rows = vec![row(2, "b1", true), row(3, "b2", true), row(4, "b3", true)];
        let mut log = EventLog::default();
        let out = execute(&backend, ImportMode::Create, &rows, ExecutorConfig::default(), &mut log);
        assert_eq!(out.success, 2);
        assert_eq!(out.failed, 1);
        assert_eq!(out.errors[0].row, 3);
        assert_eq!(out.errors[0].label, "b2");
        assert_eq!(out.errors[0].message, "b2 rejected (HTTP 400)");
        assert_eq!(backend.calls(), vec!["b1", "b2", "b3"]);
        let pct = progress(&log);
        assert_eq!(pct.len(), 3);
        assert_eq!(pct[2], 100.0);
        assert!(matches!(log.events.last(), Some(ImportEvent::ExecutionComplete { .. })));
    }

    #[test]
    fn invalid_rows_are_never_submitted() {
        let backend = ScriptedBackend::new(vec![]);
        let rows = vec![
            row(2, "ok1", true),
            row(3, "broken", false),
            row(4, "ok2", true),
        ];
        let mut log = EventLog::default();
        let out = execute(&backend, ImportMode::Create, &rows, ExecutorConfig::default(), &mut log);
        assert_eq!(out.success, 2);
        assert_eq!(out.failed, 0);
        assert_eq!(backend.calls(), vec!["ok1", "ok2"]);
        assert_eq!(progress(&log), vec![50.0, 100.0]);
    }

    #[test]
    fn progress_is_k_over_n_and_monotonic() {
        let backend = ScriptedBackend::new(vec!["r3"]);
        let rows: Vec<_> = (1..=5).map(|k| row(k + 1, &format!("r{}", k), true)).collect();
        let mut log = EventLog::default();
        let out = execute(&backend, ImportMode::Create, &rows, ExecutorConfig::default(), &mut log);
        assert_eq!((out.success, out.failed), (4, 1));
        let pct = progress(&log);
        for (k, p) in pct.iter().enumerate() {
            assert_eq!(*p, progress_percent(k + 1, 5));
        }
        assert!(pct.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stopping_from_the_sink_issues_no_further_calls() {
        let backend = ScriptedBackend::new(vec![]);
        let rows: Vec<_> = (1..=4).map(|k| row(k + 1, &format!("r{}", k), true)).collect();
        let mut seen = 0usize;
        let mut sink = |e: &ImportEvent| {
            if let ImportEvent::ExecutionProgress { .. } = e {
                seen += 1;
                if seen == 2 {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        };
        let out = execute(&backend, ImportMode::Create, &rows, ExecutorConfig::default(), &mut sink);
        assert!(out.interrupted);
        assert_eq!(out.success, 2);
        assert_eq!(backend.calls(), vec!["r1", "r2"]);
    }

    #[test]
    fn wider_windows_keep_row_order_in_outcome() {
        let backend = ScriptedBackend::new(vec!["r2", "r5"]);
        let rows: Vec<_> = (1..=5).map(|k| row(k + 1, &format!("r{}", k), true)).collect();
        let mut log = EventLog::default();
        let out = execute(
            &backend,
            ImportMode::Create,
            &rows,
            ExecutorConfig { max_in_flight: 3 },
            &mut log,
        );
        assert_eq!((out.success, out.failed), (3, 2));
        let failed_rows: Vec<_> = out.errors.iter().map(|e| e.row).collect();
        assert_eq!(failed_rows, vec![3, 6]);
        let saved_rows: Vec<_> = out.saved.iter().map(|s| s.row).collect();
        assert_eq!(saved_rows, vec![2, 4, 5]);
        assert_eq!(progress(&log).last().copied(), Some(100.0));
    }

    #[test]
    fn empty_run_completes_immediately() {
        let backend = ScriptedBackend::new(vec![]);
        let mut log = EventLog::default();
        let out = execute(&backend, ImportMode::Create, &[], ExecutorConfig::default(), &mut log);
        assert_eq!(out, ExecutionOutcome::default());
        assert_eq!(log.events.len(), 1);
    }
}
