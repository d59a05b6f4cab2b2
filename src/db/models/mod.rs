//! Ledger models: applied backend migrations and import progress.

pub mod import_progress;
pub mod migration_record;

pub use import_progress::*;
pub use migration_record::*;
