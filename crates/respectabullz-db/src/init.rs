//! Startup sequencing: bootstrap or migrate, then import legacy data once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{StoreConfig, LEGACY_SNAPSHOT_KEY};
use crate::db::{table_exists, Database, DbError};
use crate::importer::{target_is_empty, ImportError, ImportOutcome, LegacyImporter, MigratedCounts};
use crate::runner::{MigrationError, MigrationRunner};
use crate::schema::{self, BootstrapError};
use crate::snapshot::SnapshotReader;
use crate::storage::SnapshotStorage;
use crate::version::get_version;

/// Table whose presence means the schema was created before.
const SCHEMA_PROBE_TABLE: &str = "dogs";

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create database schema at statement #{index}")]
    SchemaBootstrap {
        index: usize,
        statement: String,
        source: rusqlite::Error,
    },
    #[error("database migration failed")]
    Migration(#[from] MigrationError),
    #[error("legacy data import failed")]
    Import(#[from] ImportError),
    #[error("pre-migration backup failed")]
    Backup(#[source] DbError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("initialization panicked: {0}")]
    Panic(String),
}

impl From<BootstrapError> for InitError {
    fn from(err: BootstrapError) -> Self {
        Self::SchemaBootstrap {
            index: err.index,
            statement: err.statement,
            source: err.source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Bootstrapping,
    Migrating,
    Importing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    pub snapshot_key: String,
    /// Where to write `pre-migration-v<N>.db` before migrating; `None` skips it.
    pub backup_dir: Option<PathBuf>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            snapshot_key: LEGACY_SNAPSHOT_KEY.to_string(),
            backup_dir: None,
        }
    }
}

impl From<&StoreConfig> for InitOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            snapshot_key: config.snapshot_key.clone(),
            backup_dir: config.backup_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    pub success: bool,
    /// Whether legacy data was imported during this start.
    pub migrated: bool,
    pub migrated_counts: Option<MigratedCounts>,
    pub error: Option<String>,
    pub schema_version: i64,
    pub state: InitState,
    /// State the run was in when it failed.
    pub failed_during: Option<InitState>,
}

pub struct Initializer<'a, S: SnapshotStorage + ?Sized> {
    db: &'a mut Database,
    storage: &'a S,
    options: InitOptions,
}

impl<'a, S: SnapshotStorage + ?Sized> Initializer<'a, S> {
    pub fn new(db: &'a mut Database, storage: &'a S, options: InitOptions) -> Self {
        Self {
            db,
            storage,
            options,
        }
    }

    /// Bring the store to the current schema and import legacy data if due.
    ///
    /// Never panics and never returns an error: every failure, panics
    /// included, ends in a report with `state == Failed`.
    pub fn initialize(&mut self, on_progress: &mut dyn FnMut(&str, usize, usize)) -> InitReport {
        let mut state = InitState::Bootstrapping;

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.advance(&mut state, on_progress)));
        let err = match outcome {
            Ok(Ok(report)) => return report,
            Ok(Err(err)) => err,
            Err(payload) => InitError::Panic(panic_message(payload.as_ref())),
        };

        let message = crate::describe_error(&err);
        tracing::error!("Initialization failed while {:?}: {}", state, message);

        let migrated_counts = match &err {
            InitError::Import(import) => import.migrated_counts().cloned(),
            _ => None,
        };
        InitReport {
            success: false,
            migrated: false,
            migrated_counts,
            error: Some(message),
            schema_version: get_version(self.db.conn()).unwrap_or_default(),
            state: InitState::Failed,
            failed_during: Some(state),
        }
    }

    fn advance(
        &mut self,
        state: &mut InitState,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<InitReport, InitError> {
        if table_exists(self.db.conn(), SCHEMA_PROBE_TABLE)? {
            *state = InitState::Migrating;
            self.migrate(on_progress)?;
        } else {
            *state = InitState::Bootstrapping;
            tracing::info!("No schema found; creating database schema");
            on_progress("bootstrap", 0, 1);
            schema::bootstrap(self.db.conn_mut())?;
            on_progress("bootstrap", 1, 1);
        }

        *state = InitState::Importing;
        let migrated_counts = self.import_if_due(on_progress)?;

        *state = InitState::Ready;
        let schema_version = get_version(self.db.conn())?;
        tracing::info!("Database ready at schema v{}", schema_version);

        Ok(InitReport {
            success: true,
            migrated: migrated_counts.is_some(),
            migrated_counts,
            error: None,
            schema_version,
            state: InitState::Ready,
            failed_during: None,
        })
    }

    fn migrate(
        &mut self,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<(), InitError> {
        let status = MigrationRunner::status_of(self.db.conn())?;
        if status.pending_versions.is_empty() {
            tracing::debug!("Schema v{} is current", status.current_version);
            return Ok(());
        }

        self.backup_before_migrating(status.current_version)?;
        MigrationRunner::new(self.db.conn_mut()).run(on_progress)?;
        Ok(())
    }

    fn backup_before_migrating(&self, from_version: i64) -> Result<(), InitError> {
        let (Some(dir), Some(_)) = (&self.options.backup_dir, self.db.path()) else {
            return Ok(());
        };
        let out_file = dir.join(format!("pre-migration-v{from_version}.db"));
        self.db.backup_to(&out_file).map_err(InitError::Backup)
    }

    fn import_if_due(
        &mut self,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<Option<MigratedCounts>, InitError> {
        if !target_is_empty(self.db.conn())? {
            tracing::debug!("Database already holds data; legacy import skipped");
            return Ok(None);
        }

        let reader = SnapshotReader::new(self.storage, self.options.snapshot_key.clone());
        if !reader.has_legacy_data() {
            return Ok(None);
        }

        let outcome = LegacyImporter::new(
            self.db.conn_mut(),
            self.storage,
            self.options.snapshot_key.clone(),
        )
        .run(on_progress)?;

        Ok(match outcome {
            ImportOutcome::Imported(counts) => Some(counts),
            ImportOutcome::TargetNotEmpty | ImportOutcome::NothingToImport => None,
        })
    }
}

/// Readable text for a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    if let Some(value) = payload.downcast_ref::<serde_json::Value>() {
        for field in ["message", "error"] {
            if let Some(text) = value.get(field).and_then(serde_json::Value::as_str) {
                return text.to_string();
            }
        }
        return value.to_string();
    }
    "unknown panic payload".to_string()
}
