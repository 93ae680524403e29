//! # courier-store
//!
//! Durable, schema-versioned local store for a messaging account.
//!
//! Opening a [`Database`] runs the [`migration`] engine before the handle is
//! returned: a fresh file gets the full current schema, an older file is
//! upgraded in one all-or-nothing transaction, and a file written by a newer
//! build is refused.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Entity stores (recipients, sessions…)  │
//! ├─────────────────────────────────────────┤
//! │  AccountDatabase (ACCOUNT_SCHEMA, v9)   │
//! │  Migrator (user_version, exclusive tx)  │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL, Arc<Mutex>)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use courier_store::AccountDatabase;
//!
//! let db = AccountDatabase::init("data/account.db")?;
//! let version = db.schema_version()?;
//! ```

pub mod db;
pub mod error;
pub mod migration;
pub mod schema;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use migration::{AppliedStep, CreationStep, MigrationReport, MigrationStep, Schema};
pub use schema::{ACCOUNT_DATABASE_VERSION, ACCOUNT_SCHEMA, AccountDatabase};
