//! Single-row schema version table.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{now_rfc3339, table_exists};

pub const VERSION_TABLE: &str = "schema_version";

const CREATE_VERSION_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version INTEGER NOT NULL,
  applied_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub current_version: i64,
    pub applied_at: String,
}

/// Current applied schema version. A missing table or row reads as 0,
/// which is how a fresh install looks.
///
/// # Errors
/// Returns an error when the version table exists but cannot be read.
pub fn get_version(conn: &Connection) -> Result<i64, rusqlite::Error> {
    Ok(version_record(conn)?.map_or(0, |record| record.current_version))
}

/// # Errors
/// Returns an error when the version table exists but cannot be read.
pub fn version_record(conn: &Connection) -> Result<Option<SchemaVersionRecord>, rusqlite::Error> {
    if !table_exists(conn, VERSION_TABLE)? {
        return Ok(None);
    }

    conn.query_row(
        "SELECT version, applied_at FROM schema_version WHERE id = 1",
        [],
        |row| {
            Ok(SchemaVersionRecord {
                current_version: row.get(0)?,
                applied_at: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Record `version` as applied now. Callers guarantee it never decreases.
///
/// # Errors
/// Returns an error when the table cannot be created or the row written.
pub fn set_version(conn: &Connection, version: i64) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CREATE_VERSION_TABLE_SQL)?;
    conn.execute(
        "INSERT INTO schema_version (id, version, applied_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             version = excluded.version, applied_at = excluded.applied_at",
        params![version, now_rfc3339()],
    )?;
    tracing::debug!("Schema version set to {}", version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn missing_table_reads_as_zero() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        assert_eq!(get_version(&conn)?, 0);
        assert!(version_record(&conn)?.is_none());
        Ok(())
    }

    #[test]
    fn empty_table_reads_as_zero() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_VERSION_TABLE_SQL)?;
        assert_eq!(get_version(&conn)?, 0);
        Ok(())
    }

    #[test]
    fn set_version_keeps_a_single_row() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        set_version(&conn, 2)?;
        set_version(&conn, 5)?;

        assert_eq!(get_version(&conn)?, 5);
        let rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?;
        assert_eq!(rows, 1);

        let record = version_record(&conn)?;
        assert!(record.is_some_and(|record| record.applied_at.ends_with('Z')));
        Ok(())
    }

    #[test]
    fn singleton_check_rejects_second_row() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        set_version(&conn, 1)?;
        let result = conn.execute(
            "INSERT INTO schema_version (id, version, applied_at) VALUES (2, 9, 'x')",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }
}
