//! Error types for the courier-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while opening or migrating the account store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The persisted schema version is newer than this build understands.
    ///
    /// The store was written by a newer release; it must not be opened.
    #[error("incompatible database version: found v{found}, this build supports up to v{supported}")]
    IncompatibleVersion { found: u32, supported: u32 },

    /// A schema migration step failed. The whole run was rolled back and the
    /// store is still at its previous version.
    #[error("migration v{version} ({entity}) failed: {message}")]
    Migration {
        version: u32,
        entity: &'static str,
        message: String,
    },

    /// A schema definition is malformed (a programming error in the step table).
    #[error("invalid schema definition: {0}")]
    InvalidSchema(String),

    /// A blocking task was cancelled or panicked, or the connection mutex was poisoned.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
