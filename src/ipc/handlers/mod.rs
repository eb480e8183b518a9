pub mod core;
pub mod import;
pub mod records;
pub mod setup;
