//! Respectabullz local store: schema lifecycle and legacy data import.
//!
//! The entry point is [`Initializer::initialize`], called once per process
//! start before any feature code touches the database. It creates the schema
//! on a brand-new store, migrates an existing one forward, and imports the
//! pre-relational JSON snapshot the first time a store is empty.

pub mod coerce;
pub mod collections;
pub mod config;
pub mod db;
pub mod importer;
pub mod init;
pub mod runner;
pub mod schema;
pub mod snapshot;
pub mod steps;
pub mod storage;
pub mod version;

pub use config::StoreConfig;
pub use db::{Database, DatabaseHandle, DbError, ExecuteOutcome, IntegrityReport};
pub use importer::{ImportError, ImportOutcome, ImportResult, LegacyImporter};
pub use init::{InitError, InitOptions, InitReport, InitState, Initializer};
pub use runner::{MigrationError, MigrationOutcome, MigrationRunner, SchemaStatus};
pub use snapshot::{LegacySnapshot, SnapshotError, SnapshotReader, SnapshotSummary};
pub use steps::{MigrationStep, STEPS, TARGET_VERSION};
pub use storage::{FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage, StorageError};

/// Render an error and its sources as one line, `outer: inner: root`.
///
/// Sources whose text is already part of the message are skipped.
pub fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_error_joins_the_source_chain() {
        let err = MigrationError::Step {
            version: 4,
            name: "litters_external_sires",
            source: rusqlite::Error::InvalidQuery,
        };
        let message = describe_error(&err);
        assert!(message.starts_with("migration step v4 (litters_external_sires) failed: "));
        assert!(message.len() > "migration step v4 (litters_external_sires) failed: ".len());
    }

    #[test]
    fn describe_error_skips_repeated_sources() {
        let err = DbError::Sqlite(rusqlite::Error::InvalidQuery);
        let message = describe_error(&err);
        assert_eq!(message, err.to_string());
    }
}
