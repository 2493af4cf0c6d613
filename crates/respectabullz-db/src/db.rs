//! Database handle for the Respectabullz store.
//!
//! Owns the single `SQLite` connection the app uses. Every other component
//! borrows the connection from here instead of reaching for a global.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, DatabaseName, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StoreConfig;
use crate::runner::{MigrationRunner, SchemaStatus};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

/// Result of a single write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub rows_affected: usize,
    pub last_insert_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Database manager for Respectabullz
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|source| DbError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        configure(&conn)?;

        tracing::debug!("Opened database at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database (tests and dry runs).
    ///
    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get inner connection reference
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run one parameterized write statement.
    ///
    /// # Errors
    /// Returns an error when the statement fails.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<ExecuteOutcome, DbError> {
        let rows_affected = self.conn.execute(sql, params)?;
        Ok(ExecuteOutcome {
            rows_affected,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, DbError> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;

        let foreign_key_violations = foreign_key_violations(&self.conn)?;
        let schema_status = MigrationRunner::status_of(&self.conn)?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Write an online backup of the main database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_to(&self, out_file: &Path) -> Result<(), DbError> {
        if let Some(parent) = out_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.conn.backup(DatabaseName::Main, out_file, None)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions(out_file, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    "Failed to restrict permissions on backup {}: {}",
                    out_file.display(),
                    err
                );
            }
        }

        tracing::info!("Wrote database backup to {}", out_file.display());
        Ok(())
    }

    /// Close the connection, surfacing any error SQLite reports on shutdown.
    ///
    /// # Errors
    /// Returns the error reported by `sqlite3_close`.
    pub fn close(self) -> Result<(), DbError> {
        self.conn.close().map_err(|(_, err)| DbError::Sqlite(err))
    }
}

/// Lazily opened, memoized database for the configured path.
pub struct DatabaseHandle {
    config: StoreConfig,
    db: Option<Database>,
}

impl DatabaseHandle {
    pub fn new(config: StoreConfig) -> Self {
        Self { config, db: None }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Return the open database, opening it on first use.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn database(&mut self) -> Result<&mut Database, DbError> {
        let db = match self.db.take() {
            Some(db) => db,
            None => Database::open(&self.config.db_path)?,
        };
        Ok(self.db.insert(db))
    }

    /// Close the memoized connection if one is open.
    ///
    /// # Errors
    /// Returns the error reported while closing.
    pub fn close(&mut self) -> Result<(), DbError> {
        match self.db.take() {
            Some(db) => db.close(),
            None => Ok(()),
        }
    }
}

fn configure(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

pub(crate) fn foreign_key_violations(
    conn: &Connection,
) -> Result<Vec<ForeignKeyViolation>, rusqlite::Error> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Whether a table named `table_name` exists in the main schema.
///
/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )
    .map(|exists| exists == 1)
}

/// Whether `table` has a column named `column`; false when the table is missing.
///
/// # Errors
/// Returns an error when `PRAGMA table_info` fails.
pub fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, rusqlite::Error> {
    Ok(table_columns(conn, table)?.iter().any(|info| info.name == column))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
}

/// Columns of `table` in declaration order; empty when the table is missing.
///
/// # Errors
/// Returns an error when `PRAGMA table_info` fails.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            declared_type: row.get(2)?,
            not_null: row.get::<_, i64>(3)? == 1,
        })
    })?
    .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn open_enables_foreign_keys() -> Result<()> {
        let db = Database::open_in_memory()?;
        let enabled: i64 = db.conn().query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(enabled, 1);
        Ok(())
    }

    #[test]
    fn execute_reports_rows_and_rowid() -> Result<()> {
        let db = Database::open_in_memory()?;
        db.conn().execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")?;
        let outcome = db.execute("INSERT INTO t (v) VALUES (?1)", &[&"a"])?;
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.last_insert_id, 1);
        Ok(())
    }

    #[test]
    fn table_probes_report_missing_tables() -> Result<()> {
        let db = Database::open_in_memory()?;
        assert!(!table_exists(db.conn(), "dogs")?);
        assert!(!table_has_column(db.conn(), "dogs", "id")?);
        assert!(table_columns(db.conn(), "dogs")?.is_empty());

        db.conn().execute_batch("CREATE TABLE dogs (id TEXT PRIMARY KEY, name TEXT NOT NULL)")?;
        assert!(table_exists(db.conn(), "dogs")?);
        assert!(table_has_column(db.conn(), "dogs", "name")?);
        assert!(!table_has_column(db.conn(), "dogs", "breed")?);
        Ok(())
    }

    #[test]
    fn handle_opens_lazily_and_closes() -> Result<()> {
        let dir = tempdir()?;
        let config = StoreConfig::in_dir(dir.path());
        let mut handle = DatabaseHandle::new(config);
        assert!(!handle.is_open());
        assert!(!dir.path().join("respectabullz.db").exists());

        handle.database()?;
        assert!(handle.is_open());
        assert!(dir.path().join("respectabullz.db").exists());

        handle.close()?;
        assert!(!handle.is_open());
        Ok(())
    }

    #[test]
    fn backup_writes_a_readable_copy() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(&dir.path().join("live.db"))?;
        db.conn().execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('kept');")?;

        let backup_path = dir.path().join("backups").join("copy.db");
        db.backup_to(&backup_path)?;

        let copy = Database::open(&backup_path)?;
        let value: String = copy.conn().query_row("SELECT v FROM t", [], |row| row.get(0))?;
        assert_eq!(value, "kept");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&backup_path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }
}
