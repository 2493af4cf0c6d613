//! Canonical schema for brand-new stores.

use rusqlite::Connection;
use thiserror::Error;

use crate::steps::{SEED_HEALTH_SCHEDULE_SQL, TARGET_VERSION};
use crate::version::set_version;

pub const CANONICAL_SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

#[derive(Debug, Error)]
#[error("schema statement #{index} failed: {statement}")]
pub struct BootstrapError {
    pub index: usize,
    pub statement: String,
    pub source: rusqlite::Error,
}

/// Split a SQL script into executable statements.
///
/// Comment-only and blank lines are dropped before splitting on `;`, so a
/// statement never starts with its leading comment block.
pub fn split_statements(sql: &str) -> Vec<String> {
    let code = sql
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n");

    code.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

/// Create the full current schema, load seed data and stamp the target version,
/// all in one transaction.
///
/// Returns the number of statements executed.
///
/// # Errors
/// Returns the first statement that failed together with its position.
pub fn bootstrap(conn: &mut Connection) -> Result<usize, BootstrapError> {
    let statements = split_statements(CANONICAL_SCHEMA_SQL)
        .into_iter()
        .chain(split_statements(SEED_HEALTH_SCHEDULE_SQL))
        .collect::<Vec<_>>();

    let tx = conn.transaction().map_err(|source| BootstrapError {
        index: 0,
        statement: "BEGIN".to_string(),
        source,
    })?;

    for (index, statement) in statements.iter().enumerate() {
        tx.execute_batch(statement).map_err(|source| BootstrapError {
            index,
            statement: statement.clone(),
            source,
        })?;
    }

    let finish = |source| BootstrapError {
        index: statements.len(),
        statement: "COMMIT".to_string(),
        source,
    };
    set_version(&tx, TARGET_VERSION).map_err(finish)?;
    tx.commit().map_err(finish)?;

    tracing::info!(
        "Bootstrapped canonical schema v{} ({} statements)",
        TARGET_VERSION,
        statements.len()
    );
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{table_exists, table_has_column};
    use crate::version::get_version;
    use anyhow::Result;

    #[test]
    fn split_drops_comments_and_empty_statements() {
        let sql = concat!(
            "-- header\n\nCREATE TABLE a (id INTEGER);\n",
            "  -- note\nCREATE TABLE b (\n  id INTEGER\n);\n;\n",
        );
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id INTEGER)", "CREATE TABLE b (\n  id INTEGER\n)"]
        );
    }

    #[test]
    fn canonical_schema_has_no_comment_residue() {
        for statement in split_statements(CANONICAL_SCHEMA_SQL) {
            assert!(!statement.contains("--"), "{statement}");
            assert!(
                statement.starts_with("CREATE TABLE") || statement.starts_with("CREATE INDEX"),
                "{statement}"
            );
        }
    }

    #[test]
    fn bootstrap_creates_final_shape_and_stamps_version() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let executed = bootstrap(&mut conn)?;
        assert!(executed > 20);

        assert_eq!(get_version(&conn)?, TARGET_VERSION);
        assert!(table_exists(&conn, "puppy_health_tasks")?);
        assert!(table_has_column(&conn, "litters", "external_stud_id")?);
        assert!(table_has_column(&conn, "waitlist_entries", "position")?);

        let templates: i64 =
            conn.query_row("SELECT COUNT(*) FROM health_schedule_templates", [], |row| row.get(0))?;
        assert_eq!(templates, 6);
        Ok(())
    }

    #[test]
    fn bootstrap_failure_names_the_statement() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE VIEW dogs AS SELECT 1 AS id;")?;

        let err = match bootstrap(&mut conn) {
            Ok(_) => anyhow::bail!("bootstrap should fail when a view shadows a table"),
            Err(err) => err,
        };
        assert!(err.statement.contains("dogs"));
        assert!(!table_exists(&conn, "settings")?);
        Ok(())
    }
}
