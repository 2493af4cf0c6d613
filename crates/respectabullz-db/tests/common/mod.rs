//! Shared fixtures for the store integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use respectabullz_db::db::table_columns;
use respectabullz_db::{Database, FileSnapshotStorage, MigrationRunner, StoreConfig, STEPS};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const SNAPSHOT_KEY: &str = "respectabullz-storage";

/// Temporary store directory with a file-backed database and snapshot storage.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: StoreConfig,
    pub db: Database,
    pub storage: FileSnapshotStorage,
}

impl TestContext {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config = StoreConfig::in_dir(temp_dir.path());
        let db = Database::open(&config.db_path)?;
        let storage = FileSnapshotStorage::new(&config.storage_dir);
        Ok(Self {
            temp_dir,
            config,
            db,
            storage,
        })
    }

    /// Store built by replaying steps up to `version`, as an older release left it.
    pub fn at_version(version: i64) -> Result<Self> {
        let mut ctx = Self::new()?;
        let steps = usize::try_from(version)?;
        MigrationRunner::with_steps(ctx.db.conn_mut(), &STEPS[..steps])
            .run(&mut |_: &str, _, _| {})?;
        Ok(ctx)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn conn(&self) -> &Connection {
        self.db.conn()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.config.storage_dir.join(format!("{SNAPSHOT_KEY}.json"))
    }

    pub fn write_snapshot(&self, snapshot: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.config.storage_dir)?;
        std::fs::write(self.snapshot_path(), serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }

    pub fn snapshot_exists(&self) -> bool {
        self.snapshot_path().exists()
    }

    pub fn count(&self, table: &str) -> Result<i64> {
        count(self.conn(), table)
    }
}

pub fn count(conn: &Connection, table: &str) -> Result<i64> {
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}

pub fn insert_dog(conn: &Connection, id: &str, name: &str, sex: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO dogs (id, name, sex, breed, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'American Bully',
                 '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
        params![id, name, sex],
    )?;
    Ok(())
}

/// Three dogs (sire, dam, puppy), one litter, a client with a sale and a
/// few dependent records, in the camelCase shape the old app persisted.
pub fn sample_snapshot() -> Value {
    json!({
        "state": {
            "dogs": [
                {
                    "id": "dog-puppy", "name": "Blue Steel", "sex": "M", "breed": "American Bully",
                    "dateOfBirth": "2024-02-10", "sireId": "dog-sire", "damId": "dog-dam",
                    "litterId": "litter-1", "isRetained": "no", "createdAt": 1707523200000_i64
                },
                {
                    "id": "dog-sire", "name": "King", "sex": "M", "breed": "American Bully",
                    "dateOfBirth": {"$date": "2019-05-01T00:00:00.000Z"}, "isRetained": true,
                    "registrationJson": {"abkc": "X-1"}
                },
                {
                    "id": "dog-dam", "name": "Queen", "sex": "F", "breed": "American Bully",
                    "date_of_birth": "05/20/2020", "isRetained": 1
                }
            ],
            "litters": [
                {
                    "id": "litter-1", "code": "K24", "sireId": "dog-sire", "damId": "dog-dam",
                    "breedingDate": "2023-12-10", "whelpDate": "2024-02-10T08:30:00",
                    "totalBorn": "6", "totalAlive": 5, "status": "whelped"
                }
            ],
            "heatCycles": [
                {"id": "heat-1", "dogId": "dog-dam", "startDate": "2023-11-25"}
            ],
            "weightEntries": [
                {"id": "w-1", "dogId": "dog-puppy", "date": "2024-03-01", "weightLbs": "4.2"}
            ],
            "clients": [
                {"id": "client-1", "name": "Pat Doe", "email": "pat@example.com"}
            ],
            "sales": [
                {"id": "sale-1", "clientId": "client-1", "saleDate": "2024-04-20",
                 "price": 3500, "isShipped": "false"}
            ],
            "salePuppies": [
                {"id": "sp-1", "saleId": "sale-1", "dogId": "dog-puppy", "price": 3500}
            ],
            "waitlistEntries": [
                {"id": "wait-2", "clientId": "client-1", "litterId": "litter-1",
                 "createdAt": "2024-01-02"},
                {"id": "wait-1", "clientId": "client-1", "litterId": "litter-1",
                 "createdAt": "2024-01-01"}
            ],
            "settings": {"kennelName": "Bullyville"}
        },
        "version": 0
    })
}

/// Columns, nullability and index names of every user table.
#[derive(Debug, PartialEq, Eq)]
pub struct SchemaShape {
    pub tables: BTreeMap<String, BTreeSet<(String, bool)>>,
    pub indexes: BTreeSet<String>,
}

pub fn schema_shape(conn: &Connection) -> Result<SchemaShape> {
    let mut stmt = conn.prepare(
        "SELECT type, name FROM sqlite_master
         WHERE type IN ('table', 'index') AND name NOT LIKE 'sqlite_%'",
    )?;
    let entries = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut shape = SchemaShape {
        tables: BTreeMap::new(),
        indexes: BTreeSet::new(),
    };
    for (kind, name) in entries {
        if kind == "index" {
            shape.indexes.insert(name);
            continue;
        }
        let columns = table_columns(conn, &name)?
            .into_iter()
            .map(|column| (column.name, column.not_null))
            .collect();
        shape.tables.insert(name, columns);
    }
    Ok(shape)
}
