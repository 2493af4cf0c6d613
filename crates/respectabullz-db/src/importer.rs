//! One-time import of the legacy snapshot into the relational schema.

use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::coerce::coerce_field;
use crate::collections::{CollectionSpec, Conflict, FieldKind, COLLECTIONS, CORE_TABLES};
use crate::db::{now_rfc3339, table_exists};
use crate::snapshot::{LegacySnapshot, Record, SnapshotError, SnapshotReader};
use crate::steps::BACKFILL_WAITLIST_POSITIONS_SQL;
use crate::storage::{SnapshotStorage, StorageError};

pub const IMPORT_COMPLETED_AT_SETTING: &str = "legacy_import.completed_at";
pub const IMPORT_SHA256_SETTING: &str = "legacy_import.sha256";

pub type MigratedCounts = BTreeMap<String, usize>;

/// Legacy ids of merged rows, keyed by table, mapped to the kept row's id.
type IdAliases = BTreeMap<(&'static str, String), String>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{collection} record #{index} is missing required field {field}")]
    MissingField {
        collection: &'static str,
        index: usize,
        field: &'static str,
    },
    #[error("failed to insert {collection} record #{index}")]
    Insert {
        collection: &'static str,
        index: usize,
        source: rusqlite::Error,
    },
    #[error("legacy import stopped at {collection}")]
    PartialFailure {
        collection: &'static str,
        migrated_counts: MigratedCounts,
        source: Box<ImportError>,
    },
    #[error("failed to link imported records")]
    Finalize {
        migrated_counts: MigratedCounts,
        source: rusqlite::Error,
    },
    #[error("legacy data was imported but the snapshot could not be deleted")]
    SnapshotDelete {
        migrated_counts: MigratedCounts,
        source: StorageError,
    },
    #[error("legacy snapshot could not be read: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ImportError {
    /// Rows committed before the failure.
    pub fn migrated_counts(&self) -> Option<&MigratedCounts> {
        match self {
            Self::PartialFailure {
                migrated_counts, ..
            }
            | Self::Finalize {
                migrated_counts, ..
            }
            | Self::SnapshotDelete {
                migrated_counts, ..
            } => Some(migrated_counts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub migrated_counts: MigratedCounts,
    pub success: bool,
    pub error: Option<String>,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Core tables already hold data; nothing was touched.
    TargetNotEmpty,
    /// No snapshot, or one without any core data.
    NothingToImport,
    Imported(MigratedCounts),
}

impl ImportOutcome {
    pub fn counts(&self) -> MigratedCounts {
        match self {
            Self::Imported(counts) => counts.clone(),
            Self::TargetNotEmpty | Self::NothingToImport => MigratedCounts::new(),
        }
    }
}

/// Link from a row to another row whose insert may come later.
#[derive(Debug)]
struct DeferredLink {
    table: &'static str,
    column: &'static str,
    row_id: String,
    target_table: &'static str,
    target_id: String,
}

pub struct LegacyImporter<'a, S: SnapshotStorage + ?Sized> {
    conn: &'a mut Connection,
    reader: SnapshotReader<'a, S>,
    plan: &'a [CollectionSpec],
}

impl<'a, S: SnapshotStorage + ?Sized> LegacyImporter<'a, S> {
    pub fn new(conn: &'a mut Connection, storage: &'a S, snapshot_key: impl Into<String>) -> Self {
        Self {
            conn,
            reader: SnapshotReader::new(storage, snapshot_key),
            plan: COLLECTIONS,
        }
    }

    /// Import only `plan`, in the given order.
    #[must_use]
    pub fn with_plan(mut self, plan: &'a [CollectionSpec]) -> Self {
        self.plan = plan;
        self
    }

    /// Whether every core table is absent or empty.
    ///
    /// # Errors
    /// Returns an error when a core table cannot be queried.
    pub fn target_is_empty(&self) -> Result<bool, rusqlite::Error> {
        target_is_empty(&*self.conn)
    }

    /// Run the import and fold the outcome into an [`ImportResult`].
    pub fn import_legacy_data(
        &mut self,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> ImportResult {
        match self.run(on_progress) {
            Ok(outcome) => ImportResult {
                migrated_counts: outcome.counts(),
                success: true,
                error: None,
            },
            Err(err) => {
                tracing::error!("Legacy import failed: {}", crate::describe_error(&err));
                ImportResult {
                    migrated_counts: err.migrated_counts().cloned().unwrap_or_default(),
                    success: false,
                    error: Some(crate::describe_error(&err)),
                }
            }
        }
    }

    /// Import every planned collection, link deferred references, record the
    /// audit settings and finally delete the snapshot.
    ///
    /// The snapshot is only deleted after every collection committed.
    ///
    /// # Errors
    /// Returns an error carrying the counts committed so far when a collection,
    /// the linking pass or the snapshot delete fails.
    pub fn run(
        &mut self,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<ImportOutcome, ImportError> {
        if !self.target_is_empty()? {
            tracing::info!("Skipping legacy import: database already holds data");
            return Ok(ImportOutcome::TargetNotEmpty);
        }

        let Some(snapshot) = self.reader.load()? else {
            tracing::debug!("No legacy snapshot under {}", self.reader.key());
            return Ok(ImportOutcome::NothingToImport);
        };
        if !snapshot.has_core_data() {
            tracing::info!("Legacy snapshot holds no core data; nothing to import");
            return Ok(ImportOutcome::NothingToImport);
        }

        tracing::info!(
            "Importing legacy snapshot ({} records across {} collections)",
            snapshot.total_records(),
            self.plan.len()
        );

        let total = self.plan.len();
        let mut migrated_counts = MigratedCounts::new();
        let mut deferred = Vec::new();
        let mut aliases = IdAliases::new();

        for (position, spec) in self.plan.iter().enumerate() {
            let records = snapshot.records(spec.snapshot_key);
            match import_collection(self.conn, spec, records, &mut deferred, &mut aliases) {
                Ok(count) => {
                    migrated_counts.insert(spec.name.to_string(), count);
                    on_progress(spec.name, position + 1, total);
                }
                Err(source) => {
                    return Err(ImportError::PartialFailure {
                        collection: spec.name,
                        migrated_counts,
                        source: Box::new(source),
                    })
                }
            }
        }

        if let Err(source) = finalize(self.conn, &snapshot, &deferred) {
            return Err(ImportError::Finalize {
                migrated_counts,
                source,
            });
        }

        if let Err(source) = self.reader.storage().remove(self.reader.key()) {
            return Err(ImportError::SnapshotDelete {
                migrated_counts,
                source,
            });
        }

        tracing::info!(
            "Legacy import complete: {} rows",
            migrated_counts.values().sum::<usize>()
        );
        Ok(ImportOutcome::Imported(migrated_counts))
    }
}

/// Whether every core table is absent or empty.
///
/// # Errors
/// Returns an error when a core table cannot be queried.
pub fn target_is_empty(conn: &Connection) -> Result<bool, rusqlite::Error> {
    for table in CORE_TABLES {
        if !table_exists(conn, table)? {
            continue;
        }
        let has_rows: i64 = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table})"),
            [],
            |row| row.get(0),
        )?;
        if has_rows == 1 {
            return Ok(false);
        }
    }
    Ok(true)
}

fn import_collection(
    conn: &mut Connection,
    spec: &CollectionSpec,
    records: &[Record],
    deferred: &mut Vec<DeferredLink>,
    aliases: &mut IdAliases,
) -> Result<usize, ImportError> {
    if records.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let mut inserted = 0;
    let mut pending_links = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let mut columns = Vec::with_capacity(spec.fields.len());
        let mut values = Vec::with_capacity(spec.fields.len());
        let mut row_id = None;

        for field in spec.fields {
            let raw = record.get(field.key).or_else(|| record.get(field.column));
            let value = match coerce_field(field.kind, raw) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        "Skipping {}.{} on record #{}: {}",
                        spec.name,
                        field.key,
                        index,
                        err
                    );
                    None
                }
            };

            let value = match (field.kind, value) {
                (FieldKind::Id, None) => Some(SqlValue::Text(Ulid::new().to_string())),
                (FieldKind::Timestamp, None) => Some(SqlValue::Text(now_rfc3339())),
                (FieldKind::DeferredRef(target_table), Some(SqlValue::Text(target_id))) => {
                    pending_links.push((field.column, target_table, target_id));
                    None
                }
                (FieldKind::SoftRef(target_table), Some(SqlValue::Text(target_id))) => {
                    let target_id = aliases
                        .get(&(target_table, target_id.clone()))
                        .cloned()
                        .unwrap_or(target_id);
                    if row_exists(&tx, target_table, &target_id)? {
                        Some(SqlValue::Text(target_id))
                    } else {
                        tracing::warn!(
                            "Dropping {}.{} on record #{}: no {} row {}",
                            spec.name,
                            field.key,
                            index,
                            target_table,
                            target_id
                        );
                        None
                    }
                }
                (_, value) => value,
            };

            match value {
                Some(value) => {
                    if field.column == "id" {
                        if let SqlValue::Text(id) = &value {
                            row_id = Some(id.clone());
                        }
                    }
                    columns.push(field.column);
                    values.push(value);
                }
                None if field.required => {
                    return Err(ImportError::MissingField {
                        collection: spec.name,
                        index,
                        field: field.key,
                    });
                }
                None => {}
            }
        }

        let merge_key = match spec.conflict {
            Conflict::Merge(column) => columns
                .iter()
                .position(|name| *name == column)
                .map(|position| (column, values[position].clone())),
            Conflict::Fail | Conflict::Replace => None,
        };

        let written =
            insert_row(&tx, spec, &columns, values).map_err(|source| ImportError::Insert {
                collection: spec.name,
                index,
                source,
            })?;
        inserted += written;

        if written == 0 {
            if let (Some((column, key)), Some(legacy_id)) = (merge_key, row_id.as_ref()) {
                let kept = existing_id(&tx, spec.table, column, &key)?;
                if let Some(kept) = kept.filter(|kept| kept != legacy_id) {
                    tracing::info!(
                        "Merged {} record {} into existing row {}",
                        spec.name,
                        legacy_id,
                        kept
                    );
                    aliases.insert((spec.table, legacy_id.clone()), kept);
                }
            }
        }

        if let Some(row_id) = row_id {
            deferred.extend(pending_links.drain(..).map(|(column, target_table, target_id)| {
                DeferredLink {
                    table: spec.table,
                    column,
                    row_id: row_id.clone(),
                    target_table,
                    target_id,
                }
            }));
        } else {
            pending_links.clear();
        }
    }

    tx.commit()?;
    tracing::info!("Imported {} {} records", inserted, spec.name);
    Ok(inserted)
}

fn insert_row(
    tx: &Transaction<'_>,
    spec: &CollectionSpec,
    columns: &[&str],
    values: Vec<SqlValue>,
) -> Result<usize, rusqlite::Error> {
    let placeholders = (1..=columns.len())
        .map(|n| format!("?{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "{} INTO {} ({}) VALUES ({})",
        spec.conflict.insert_verb(),
        spec.table,
        columns.join(", "),
        placeholders
    );
    let mut stmt = tx.prepare_cached(&sql)?;
    stmt.execute(params_from_iter(values))
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id],
        |row| row.get::<_, i64>(0),
    )
    .map(|exists| exists == 1)
}

fn existing_id(
    conn: &Connection,
    table: &str,
    column: &str,
    key: &SqlValue,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE {column} = ?1"),
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn finalize(
    conn: &mut Connection,
    snapshot: &LegacySnapshot,
    deferred: &[DeferredLink],
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;

    let mut linked = 0;
    for link in deferred {
        let updated = tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE id = ?2
                 AND EXISTS (SELECT 1 FROM {} WHERE id = ?1)",
                link.table, link.column, link.target_table
            ),
            params![link.target_id, link.row_id],
        )?;
        if updated == 0 {
            tracing::warn!(
                "Leaving {}.{} unset for {}: no {} row {}",
                link.table,
                link.column,
                link.row_id,
                link.target_table,
                link.target_id
            );
        }
        linked += updated;
    }
    if linked > 0 {
        tracing::info!("Linked {} deferred references", linked);
    }

    if table_exists(&tx, "waitlist_entries")? {
        tx.execute(BACKFILL_WAITLIST_POSITIONS_SQL, [])?;
    }

    let now = now_rfc3339();
    for (key, value) in [
        (IMPORT_COMPLETED_AT_SETTING, now.as_str()),
        (IMPORT_SHA256_SETTING, snapshot.sha256()),
    ] {
        tx.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
    }

    tx.commit()
}
