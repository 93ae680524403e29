//! Versioned schema migrator.
//!
//! A [`Schema`] carries two step tables:
//!
//! - **creation steps**, one per entity store, holding that entity's current
//!   DDL. They run only against a brand-new store.
//! - **upgrade steps**, the full history of schema changes keyed by the
//!   version threshold at which they apply ("apply if persisted version < N").
//!
//! The persisted version lives in SQLite's `user_version` header field. Every
//! run that changes anything (create or upgrade) happens inside a single
//! exclusive transaction that also stamps the new version, so a store is
//! either fully at the target version or untouched. Applied steps are also
//! logged to a `_migrations` table for diagnostics.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};

/// One entity store's table definitions for a fresh store.
#[derive(Debug, Clone, Copy)]
pub struct CreationStep {
    /// Entity store that owns the tables (e.g. `"recipient"`).
    pub entity: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    pub sql: &'static str,
}

/// A single historical schema change.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    /// Threshold version: the step runs when the persisted version is below it.
    pub version: u32,
    /// Entity store that authored the change.
    pub entity: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    pub sql: &'static str,
}

/// A complete schema definition: target version plus both step tables.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    /// Name used in log output.
    pub name: &'static str,
    /// Version this build writes. Stores above it are rejected.
    pub target: u32,
    /// Current DDL, one entry per entity store.
    pub creation: &'static [CreationStep],
    /// Upgrade history in ascending threshold order.
    pub upgrades: &'static [MigrationStep],
}

impl Schema {
    /// Check the step tables for authoring mistakes.
    ///
    /// Thresholds must be in `1..=target` and non-decreasing, so that steps
    /// sharing a threshold stay grouped in the order they were declared.
    pub fn validate(&self) -> StoreResult<()> {
        if self.target == 0 {
            return Err(StoreError::InvalidSchema(format!(
                "{}: target version must be at least 1",
                self.name
            )));
        }
        if self.creation.is_empty() {
            return Err(StoreError::InvalidSchema(format!(
                "{}: no creation steps",
                self.name
            )));
        }

        let mut previous = 0;
        for step in self.upgrades {
            if step.version == 0 || step.version > self.target {
                return Err(StoreError::InvalidSchema(format!(
                    "{}: step '{}' has threshold v{} outside 1..=v{}",
                    self.name, step.description, step.version, self.target
                )));
            }
            if step.version < previous {
                return Err(StoreError::InvalidSchema(format!(
                    "{}: step '{}' (v{}) is declared after v{}",
                    self.name, step.description, step.version, previous
                )));
            }
            previous = step.version;
        }
        Ok(())
    }

    /// Upgrade steps that apply to a store currently at `current`.
    pub fn pending_upgrades(&self, current: u32) -> impl Iterator<Item = &'static MigrationStep> {
        self.upgrades.iter().filter(move |step| step.version > current)
    }
}

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationReport {
    /// The store was empty and was created at `version`.
    Created { version: u32 },
    /// The store was already at `version`; nothing ran.
    UpToDate { version: u32 },
    /// The store was upgraded; `applied` lists `(threshold, entity)` per step.
    Upgraded {
        from: u32,
        to: u32,
        applied: Vec<(u32, &'static str)>,
    },
}

impl MigrationReport {
    /// Schema version after the run.
    pub fn version(&self) -> u32 {
        match self {
            Self::Created { version } | Self::UpToDate { version } => *version,
            Self::Upgraded { to, .. } => *to,
        }
    }

    /// Number of upgrade steps executed.
    pub fn steps_applied(&self) -> usize {
        match self {
            Self::Upgraded { applied, .. } => applied.len(),
            _ => 0,
        }
    }
}

/// A row from the `_migrations` history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub version: u32,
    pub entity: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

// ── public API ───────────────────────────────────────────────────────

/// Bring the store behind `conn` to `schema.target`.
///
/// This is a **synchronous** function; it needs exclusive use of the
/// connection for the duration of the run.
pub fn migrate(conn: &mut Connection, schema: &Schema) -> StoreResult<MigrationReport> {
    schema.validate()?;

    let current = current_version(conn)?;
    check_compatible(schema, current)?;
    if current == schema.target {
        debug!(
            schema = schema.name,
            version = current,
            "database schema is up to date"
        );
        return Ok(MigrationReport::UpToDate { version: current });
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

    // Another connection may have migrated between the first read and taking
    // the exclusive lock.
    let current = current_version(&tx)?;
    check_compatible(schema, current)?;
    if current == schema.target {
        return Ok(MigrationReport::UpToDate { version: current });
    }

    let result = run_in_transaction(&tx, schema, current);
    match result {
        Ok(report) => {
            tx.commit().map_err(|e| StoreError::Migration {
                version: schema.target,
                entity: "schema",
                message: format!("failed to commit: {e}"),
            })?;
            info!(
                schema = schema.name,
                from = current,
                to = schema.target,
                steps = report.steps_applied(),
                "database schema migrated"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(schema = schema.name, version = current, %err, "migration failed, rolling back");
            // Dropping the transaction rolls it back.
            drop(tx);
            Err(err)
        }
    }
}

/// Return the persisted schema version, or 0 for a brand-new store.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Read the step history, oldest first. Empty if the store was never migrated.
pub fn applied_steps(conn: &Connection) -> StoreResult<Vec<AppliedStep>> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_migrations')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT version, entity, description, applied_at FROM _migrations ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        let secs: i64 = row.get(3)?;
        let applied_at = DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Integer,
                format!("applied_at {secs} is outside the representable range").into(),
            )
        })?;
        Ok(AppliedStep {
            version: row.get(0)?,
            entity: row.get(1)?,
            description: row.get(2)?,
            applied_at,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ── internals ────────────────────────────────────────────────────────

pub(crate) fn check_compatible(schema: &Schema, current: u32) -> StoreResult<()> {
    if current > schema.target {
        error!(
            schema = schema.name,
            found = current,
            supported = schema.target,
            "database was written by a newer version"
        );
        return Err(StoreError::IncompatibleVersion {
            found: current,
            supported: schema.target,
        });
    }
    Ok(())
}

fn run_in_transaction(
    tx: &Transaction<'_>,
    schema: &Schema,
    current: u32,
) -> StoreResult<MigrationReport> {
    ensure_migrations_table(tx)?;

    let report = if current == 0 {
        create(tx, schema)?
    } else {
        upgrade(tx, schema, current)?
    };

    tx.pragma_update(None, "user_version", schema.target)
        .map_err(|e| StoreError::Migration {
            version: schema.target,
            entity: "schema",
            message: format!("failed to stamp version: {e}"),
        })?;
    Ok(report)
}

fn create(tx: &Transaction<'_>, schema: &Schema) -> StoreResult<MigrationReport> {
    info!(schema = schema.name, version = schema.target, "creating database");

    for step in schema.creation {
        debug!(entity = step.entity, "creating tables");
        tx.execute_batch(step.sql).map_err(|e| StoreError::Migration {
            version: schema.target,
            entity: step.entity,
            message: format!("create failed: {e}"),
        })?;
        record(tx, schema.target, step.entity, "create")?;
    }

    Ok(MigrationReport::Created {
        version: schema.target,
    })
}

fn upgrade(tx: &Transaction<'_>, schema: &Schema, current: u32) -> StoreResult<MigrationReport> {
    info!(
        schema = schema.name,
        from = current,
        to = schema.target,
        "upgrading database"
    );

    let mut applied = Vec::new();
    for step in schema.pending_upgrades(current) {
        debug!(
            version = step.version,
            entity = step.entity,
            description = step.description,
            "applying migration step"
        );
        tx.execute_batch(step.sql).map_err(|e| StoreError::Migration {
            version: step.version,
            entity: step.entity,
            message: format!("SQL execution failed: {e}"),
        })?;
        record(tx, step.version, step.entity, step.description)?;
        applied.push((step.version, step.entity));
    }

    Ok(MigrationReport::Upgraded {
        from: current,
        to: schema.target,
        applied,
    })
}

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER NOT NULL,
            entity      TEXT NOT NULL,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        entity: "schema",
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

fn record(conn: &Connection, version: u32, entity: &'static str, description: &str) -> StoreResult<()> {
    let now = Utc::now().timestamp();
    conn.execute(
        "INSERT INTO _migrations (version, entity, description, applied_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![version, entity, description, now],
    )
    .map_err(|e| StoreError::Migration {
        version,
        entity,
        message: format!("failed to record migration: {e}"),
    })?;
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
