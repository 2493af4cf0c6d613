//! Legacy snapshot parsing and detection.
//!
//! The pre-relational app persisted its whole state as one JSON blob. This
//! module only reads it; deleting it is left to the importer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::collections::{CORE_SNAPSHOT_KEYS, COLLECTIONS};
use crate::storage::{SnapshotStorage, StorageError};

pub type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot top level must be a JSON object")]
    NotAnObject,
    #[error("snapshot collection {key} must be an array")]
    CollectionShape { key: String },
}

/// Parsed legacy snapshot, keyed by snapshot collection key.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacySnapshot {
    collections: BTreeMap<String, Vec<Record>>,
    sha256: String,
}

impl LegacySnapshot {
    /// Parse a raw snapshot blob.
    ///
    /// A persisted-state wrapper `{"state": {...}}` is unwrapped. Known
    /// collections must be arrays; `settings` may also be a key/value object.
    /// Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns an error when the blob is not JSON, not an object, or a known
    /// collection has the wrong shape.
    pub fn parse(raw: &str) -> Result<Self, SnapshotError> {
        let sha256 = format!("{:x}", Sha256::digest(raw.as_bytes()));

        let mut root = match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(SnapshotError::NotAnObject),
        };
        if let Some(Value::Object(state)) = root.remove("state") {
            root = state;
        }

        let mut collections = BTreeMap::new();
        for spec in COLLECTIONS {
            let records = match root.remove(spec.snapshot_key) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => records_from(spec.snapshot_key, items),
                Some(Value::Object(map)) if spec.snapshot_key == "settings" => map
                    .into_iter()
                    .map(|(key, value)| {
                        let mut record = Record::new();
                        record.insert("key".to_string(), Value::String(key));
                        record.insert("value".to_string(), value);
                        record
                    })
                    .collect(),
                Some(_) => {
                    return Err(SnapshotError::CollectionShape {
                        key: spec.snapshot_key.to_string(),
                    })
                }
            };
            collections.insert(spec.snapshot_key.to_string(), records);
        }

        for key in root.keys() {
            tracing::debug!("Ignoring unknown snapshot key {}", key);
        }

        Ok(Self {
            collections,
            sha256,
        })
    }

    /// Records stored under snapshot key `key`; empty when absent.
    pub fn records(&self, key: &str) -> &[Record] {
        self.collections.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether any collection that marks real usage holds data.
    pub fn has_core_data(&self) -> bool {
        CORE_SNAPSHOT_KEYS
            .iter()
            .any(|key| !self.records(key).is_empty())
    }

    /// Hex SHA-256 of the raw blob.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.collections
            .iter()
            .map(|(key, records)| (key.clone(), records.len()))
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

fn records_from(key: &str, items: Vec<Value>) -> Vec<Record> {
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(record) => records.push(record),
            other => tracing::warn!(
                "Skipping non-object element #{} in snapshot collection {}: {}",
                index,
                key,
                other
            ),
        }
    }
    records
}

/// Diagnostics view of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub key: String,
    pub present: bool,
    pub has_legacy_data: bool,
    pub sha256: Option<String>,
    pub counts: BTreeMap<String, usize>,
    pub error: Option<String>,
}

pub struct SnapshotReader<'a, S: SnapshotStorage + ?Sized> {
    storage: &'a S,
    key: String,
}

impl<'a, S: SnapshotStorage + ?Sized> SnapshotReader<'a, S> {
    pub fn new(storage: &'a S, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage(&self) -> &'a S {
        self.storage
    }

    /// Read and parse the snapshot.
    ///
    /// # Errors
    /// Returns an error when the snapshot exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<LegacySnapshot>, SnapshotError> {
        match self.storage.get_raw(&self.key)? {
            Some(raw) => LegacySnapshot::parse(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Parsed snapshot; unreadable snapshots are logged and read as absent.
    pub fn read_snapshot(&self) -> Option<LegacySnapshot> {
        match self.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!("Ignoring unreadable legacy snapshot {}: {}", self.key, err);
                None
            }
        }
    }

    /// Whether a snapshot with at least one non-empty core collection exists.
    pub fn has_legacy_data(&self) -> bool {
        self.read_snapshot()
            .is_some_and(|snapshot| snapshot.has_core_data())
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut summary = SnapshotSummary {
            key: self.key.clone(),
            present: false,
            has_legacy_data: false,
            sha256: None,
            counts: BTreeMap::new(),
            error: None,
        };

        match self.load() {
            Ok(Some(snapshot)) => {
                summary.present = true;
                summary.has_legacy_data = snapshot.has_core_data();
                summary.sha256 = Some(snapshot.sha256().to_string());
                summary.counts = snapshot.counts();
            }
            Ok(None) => {}
            Err(err) => {
                summary.present = !matches!(err, SnapshotError::Storage(_));
                summary.error = Some(err.to_string());
            }
        }
        summary
    }
}
