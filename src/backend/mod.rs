//! The records backend the import engine talks to: reference collections
//! before validation, one create/update call per valid row afterwards.

pub mod rest;
pub mod store;

use crate::import::error::ExecutionError;
use crate::import::record::CandidateRecord;
use crate::import::reference::ReferenceCollections;
use crate::import::schema::ImportMode;

pub trait Backend {
    fn fetch_references(&self) -> Result<ReferenceCollections, ExecutionError>;

    /// Creates or updates one record. The id is `None` when the backend
    /// accepted the record without reporting one.
    fn submit(
        &self,
        mode: ImportMode,
        record: &CandidateRecord,
    ) -> Result<Option<i64>, ExecutionError>;
}

pub use rest::RestBackend;
pub use store::SqliteBackend;
