//! Forward-only migration runner.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::foreign_key_violations;
use crate::steps::{MigrationStep, STEPS};
use crate::version::{get_version, set_version};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration step v{version} ({name}) failed")]
    Step {
        version: i64,
        name: &'static str,
        source: rusqlite::Error,
    },
    #[error("migration steps must be dense from 1; found v{found} at position {position}")]
    StepOrder { position: usize, found: i64 },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

impl MigrationOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

pub struct MigrationRunner<'a> {
    conn: &'a mut Connection,
    steps: &'a [MigrationStep],
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self::with_steps(conn, STEPS)
    }

    /// Runner over a custom step list.
    pub fn with_steps(conn: &'a mut Connection, steps: &'a [MigrationStep]) -> Self {
        Self { conn, steps }
    }

    pub fn target_version(&self) -> i64 {
        target_of(self.steps)
    }

    /// Report current and target schema versions plus pending steps.
    ///
    /// # Errors
    /// Returns an error when the version table exists but cannot be read.
    pub fn status(&self) -> Result<SchemaStatus, MigrationError> {
        Ok(status_with(&*self.conn, self.steps)?)
    }

    /// Schema status of `conn` against the built-in steps.
    ///
    /// # Errors
    /// Returns an error when the version table exists but cannot be read.
    pub fn status_of(conn: &Connection) -> Result<SchemaStatus, rusqlite::Error> {
        status_with(conn, STEPS)
    }

    /// Apply every pending step in version order, then record the target version.
    ///
    /// Calling this on an up-to-date store reads the version and returns without
    /// writing anything.
    ///
    /// # Errors
    /// Returns an error when the step list is malformed or a step fails. The
    /// recorded version is left untouched in both cases.
    pub fn run(
        &mut self,
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<MigrationOutcome, MigrationError> {
        validate_steps(self.steps)?;

        let target = self.target_version();
        let current = get_version(self.conn)?;

        if current >= target {
            if current > target {
                tracing::warn!(
                    "Database schema v{} is newer than supported v{}; leaving it untouched",
                    current,
                    target
                );
            } else {
                tracing::debug!("Database schema is current (v{})", current);
            }
            return Ok(MigrationOutcome {
                from_version: current,
                to_version: current,
                applied: Vec::new(),
            });
        }

        let pending = self
            .steps
            .iter()
            .filter(|step| step.version > current)
            .copied()
            .collect::<Vec<_>>();

        tracing::info!(
            "Migrating database schema from v{} to v{} ({} steps)",
            current,
            target,
            pending.len()
        );

        // Table rebuilds drop and rename referenced tables.
        let fk_was_enabled =
            self.conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))? == 1;
        self.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;

        let applied = self.apply_all(&pending, on_progress);

        if fk_was_enabled {
            self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        let applied = applied?;

        set_version(self.conn, target)?;

        for violation in foreign_key_violations(self.conn)? {
            tracing::warn!(
                "Foreign key violation after migration: {} row {:?} -> {}",
                violation.table,
                violation.rowid,
                violation.parent
            );
        }

        tracing::info!("Database schema migrated to v{}", target);
        Ok(MigrationOutcome {
            from_version: current,
            to_version: target,
            applied,
        })
    }

    fn apply_all(
        &mut self,
        pending: &[MigrationStep],
        on_progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<Vec<i64>, MigrationError> {
        let total = pending.len();
        let mut applied = Vec::with_capacity(total);

        for (index, step) in pending.iter().enumerate() {
            on_progress("migrate", index, total);
            tracing::info!("Applying migration v{} ({})", step.version, step.name);

            let step_error = |source| MigrationError::Step {
                version: step.version,
                name: step.name,
                source,
            };
            let tx = self.conn.transaction().map_err(step_error)?;
            (step.apply)(&tx).map_err(step_error)?;
            tx.commit().map_err(step_error)?;

            applied.push(step.version);
        }

        on_progress("migrate", total, total);
        Ok(applied)
    }
}

fn target_of(steps: &[MigrationStep]) -> i64 {
    steps.last().map_or(0, |step| step.version)
}

fn status_with(
    conn: &Connection,
    steps: &[MigrationStep],
) -> Result<SchemaStatus, rusqlite::Error> {
    let current_version = get_version(conn)?;
    let pending_versions = steps
        .iter()
        .map(|step| step.version)
        .filter(|version| *version > current_version)
        .collect();

    Ok(SchemaStatus {
        current_version,
        target_version: target_of(steps),
        pending_versions,
    })
}

fn validate_steps(steps: &[MigrationStep]) -> Result<(), MigrationError> {
    for (position, step) in steps.iter().enumerate() {
        let expected = i64::try_from(position).map_or(i64::MAX, |index| index + 1);
        if step.version != expected {
            return Err(MigrationError::StepOrder {
                position,
                found: step.version,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{table_exists, Database};
    use crate::steps::TARGET_VERSION;
    use anyhow::Result;

    fn broken_step(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("CREATE TABLE half_done (id TEXT PRIMARY KEY);")?;
        conn.execute_batch("INSERT INTO no_such_table VALUES (1);")
    }

    fn no_progress() -> impl FnMut(&str, usize, usize) {
        |_, _, _| {}
    }

    #[test]
    fn fresh_store_runs_every_step() -> Result<()> {
        let mut db = Database::open_in_memory()?;
        let mut stages = Vec::new();
        let outcome = MigrationRunner::new(db.conn_mut()).run(&mut |stage: &str, current, total| {
            stages.push((stage.to_string(), current, total));
        })?;

        assert_eq!(outcome.from_version, 0);
        assert_eq!(outcome.to_version, TARGET_VERSION);
        assert_eq!(outcome.applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(stages.first(), Some(&("migrate".to_string(), 0, 5)));
        assert_eq!(stages.last(), Some(&("migrate".to_string(), 5, 5)));
        Ok(())
    }

    #[test]
    fn status_lists_pending_versions() -> Result<()> {
        let mut db = Database::open_in_memory()?;
        set_version(db.conn(), 3)?;
        let status = MigrationRunner::new(db.conn_mut()).status()?;
        assert_eq!(status.current_version, 3);
        assert_eq!(status.target_version, TARGET_VERSION);
        assert_eq!(status.pending_versions, vec![4, 5]);
        Ok(())
    }

    #[test]
    fn failing_step_leaves_version_and_rolls_back_step() -> Result<()> {
        let mut db = Database::open_in_memory()?;
        let steps = vec![
            STEPS[0],
            MigrationStep {
                version: 2,
                name: "broken",
                apply: broken_step,
            },
        ];

        let result = MigrationRunner::with_steps(db.conn_mut(), &steps).run(&mut no_progress());
        assert!(matches!(
            result,
            Err(MigrationError::Step { version: 2, name: "broken", .. })
        ));

        assert_eq!(get_version(db.conn())?, 0);
        assert!(table_exists(db.conn(), "dogs")?);
        assert!(!table_exists(db.conn(), "half_done")?);

        let enabled: i64 = db.conn().query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(enabled, 1);
        Ok(())
    }

    #[test]
    fn gaps_in_step_versions_are_rejected_before_applying() -> Result<()> {
        let mut db = Database::open_in_memory()?;
        let steps = vec![STEPS[0], STEPS[2]];

        let result = MigrationRunner::with_steps(db.conn_mut(), &steps).run(&mut no_progress());
        assert!(matches!(
            result,
            Err(MigrationError::StepOrder { position: 1, found: 3 })
        ));
        assert!(!table_exists(db.conn(), "dogs")?);
        Ok(())
    }

    #[test]
    fn newer_store_is_left_untouched() -> Result<()> {
        let mut db = Database::open_in_memory()?;
        set_version(db.conn(), TARGET_VERSION + 2)?;

        let outcome = MigrationRunner::new(db.conn_mut()).run(&mut no_progress())?;
        assert!(outcome.is_noop());
        assert_eq!(get_version(db.conn())?, TARGET_VERSION + 2);
        assert!(!table_exists(db.conn(), "dogs")?);
        Ok(())
    }
}
