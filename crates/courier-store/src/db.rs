//! SQLite store handle with WAL mode and connection pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>`; the mutex is the serialization point for every entity
//! store sharing the handle. Opening a handle always runs the schema
//! migrator first, so no caller can observe a half-migrated store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration::{self, MigrationReport, Schema};

/// Thread-safe handle to the account database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    report: Arc<MigrationReport>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database at `path` and bring it to `schema.target`.
    ///
    /// Fails with [`StoreError::IncompatibleVersion`] without touching the
    /// file if it was written by a newer build, and with
    /// [`StoreError::Migration`] if an upgrade step fails (the store is left
    /// at its previous version).
    ///
    /// This call blocks (file I/O and DDL), so run it during startup or via
    /// [`Database::open_and_migrate`].
    pub fn open(path: impl AsRef<Path>, schema: &Schema) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), schema = schema.name, "opening database");

        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()), schema)
    }

    /// Create an in-memory database at `schema.target`, for tests.
    pub fn open_in_memory(schema: &Schema) -> StoreResult<Self> {
        debug!(schema = schema.name, "opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::init(conn, None, schema)
    }

    /// [`Database::open`] on the blocking thread pool.
    pub async fn open_and_migrate(
        path: impl AsRef<Path> + Send + 'static,
        schema: &'static Schema,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open(&path, schema)).await?
    }

    fn init(mut conn: Connection, path: Option<PathBuf>, schema: &Schema) -> StoreResult<Self> {
        // Setting journal_mode rewrites the file header, so a store from a
        // newer build has to be rejected before any pragma runs.
        let found = migration::current_version(&conn)?;
        migration::check_compatible(schema, found)?;

        Self::apply_pragmas(&conn)?;
        let report = migration::migrate(&mut conn, schema)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            report: Arc::new(report),
        })
    }

    /// Location of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// What the migrator did when this handle was opened.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    /// Read the persisted schema version.
    pub fn schema_version(&self) -> StoreResult<u32> {
        let conn = self.lock()?;
        migration::current_version(&conn)
    }

    /// Run a closure against the connection on the calling thread.
    pub fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Execute a closure against the connection on the blocking pool.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM recipient", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock()?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure (for transactions, etc.) on the blocking pool.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock()?;
            f(&mut conn)
        })
        .await?
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL mode: readers do not block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Cascading deletes between recipient, session, identity and
        // sender-key rows depend on this.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ACCOUNT_SCHEMA;

    #[test]
    fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        assert_eq!(db.schema_version().unwrap(), ACCOUNT_SCHEMA.target);
        assert_eq!(
            db.migration_report(),
            &MigrationReport::Created {
                version: ACCOUNT_SCHEMA.target
            }
        );
        assert!(db.path().is_none());
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        let enabled: bool = db
            .with_connection(|conn| {
                Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?)
            })
            .unwrap();
        assert!(enabled);
    }

    #[tokio::test]
    async fn execute_runs_on_blocking_pool() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        let count: i64 = db
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM recipient", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn execute_mut_commits_transactions() {
        let db = Database::open_in_memory(&ACCOUNT_SCHEMA).unwrap();
        db.execute_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sticker (pack_id, pack_key, installed) VALUES (x'01', x'02', TRUE)",
                [],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .unwrap();

        let installed: bool = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT installed FROM sticker", [], |row| row.get(0))?)
            })
            .unwrap();
        assert!(installed);
    }
}
