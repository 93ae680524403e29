//! Courier service runtime.
//!
//! This crate owns the lazily constructed network-facing handles of one
//! account session:
//!
//! - **[`dependencies`]** -- [`Dependencies`] registry: one build-once slot
//!   per service handle, targeted invalidation, and the ordering guard for
//!   [`RegistryConfiguration`].
//! - **[`slot`]** -- [`Slot`] cell with double-checked construction under a
//!   per-slot build mutex, plus the [`SlotName`] enumeration.
//! - **[`services`]** -- [`ServiceFactory`] boundary to the messaging
//!   library, with the [`Transport`] and [`HealthMonitor`] hooks.
//! - **[`config`]** -- [`ServiceEnvironment`] loaded from TOML.
//! - **[`error`]** -- Unified runtime error types via [`thiserror`].
//!
//! All public types are `Send + Sync`; share a registry behind an `Arc`.

pub mod config;
pub mod dependencies;
pub mod error;
pub mod services;
pub mod slot;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::{KeyBackupConfig, RegistryConfiguration, ServiceEnvironment};
pub use dependencies::Dependencies;
pub use error::{BoxError, Result, RuntimeError};
pub use services::{BuildResult, HealthMonitor, ServiceFactory, Transport};
pub use slot::{Slot, SlotName};
