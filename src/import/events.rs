use super::execute::ExecutionOutcome;
use serde::Serialize;
use std::ops::ControlFlow;

/// Structured notifications for the UI layer; the engine itself never
/// touches the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ImportEvent {
    #[serde(rename_all = "camelCase")]
    ParseFailed { message: String },
    #[serde(rename_all = "camelCase")]
    ValidationComplete {
        rows_total: usize,
        valid: usize,
        invalid: usize,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionProgress {
        row: usize,
        attempted: usize,
        total: usize,
        percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionComplete { outcome: ExecutionOutcome },
}

/// Receives events as they happen. Returning `Break` from a progress event
/// stops the executor from issuing further backend calls.
pub trait EventSink {
    fn emit(&mut self, event: &ImportEvent) -> ControlFlow<()>;
}

impl<F> EventSink for F
where
    F: FnMut(&ImportEvent) -> ControlFlow<()>,
{
    fn emit(&mut self, event: &ImportEvent) -> ControlFlow<()> {
        self(event)
    }
}

/// Collects every event; used by the IPC layer to return them in the reply.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<ImportEvent>,
}

impl EventSink for EventLog {
    fn emit(&mut self, event: &ImportEvent) -> ControlFlow<()> {
        self.events.push(event.clone());
        ControlFlow::Continue(())
    }
}
