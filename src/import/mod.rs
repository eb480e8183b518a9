//! Bulk import and validation engine.
//!
//! parser -> mapper -> reference (resolver) -> validate -> execute, with
//! `session` tying the stages to one import dialog's lifetime.

pub mod error;
pub mod events;
pub mod execute;
pub mod mapper;
pub mod parser;
pub mod record;
pub mod reference;
pub mod schema;
pub mod session;
pub mod validate;
