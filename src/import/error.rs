//! Error taxonomy for bulk imports.
//!
//! Parse failures are fatal to the whole import. Resolution and validation
//! problems are accumulated per row as [`RowIssue`]s. Execution failures are
//! recorded per row in the outcome and never abort the batch.

use serde::Serialize;
use thiserror::Error;

/// The uploaded file could not be decoded; no rows are processed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A backend call failed for an otherwise-valid row.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(e: rusqlite::Error) -> Self {
        ExecutionError::Store(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Resolution,
    Validation,
    Duplicate,
    Conflict,
}

/// One entry in a row's ordered error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl RowIssue {
    pub fn resolution(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Resolution,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Validation,
            message: message.into(),
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Duplicate,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Conflict,
            message: message.into(),
        }
    }
}
