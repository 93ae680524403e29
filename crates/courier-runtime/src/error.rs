//! Runtime error types.
//!
//! Every public API in this crate returns [`RuntimeError`]. Slot build
//! failures are local to the caller that triggered the build; nothing here
//! poisons the registry.

use crate::slot::SlotName;

/// Boxed error produced by the external messaging library.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the courier service runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    // -- Registry errors ----------------------------------------------------
    /// Constructing a service handle failed. The slot stays empty and the
    /// next access retries the build.
    #[error("failed to build {slot}: {source}")]
    SlotBuild {
        slot: SlotName,
        #[source]
        source: BoxError,
    },

    /// The registry configuration was changed after a slot that reads it had
    /// already been built. This is a caller bug: the built slot keeps the
    /// options it captured and the change is refused.
    #[error("configuration changed after {captured_by:?} captured it")]
    ConfigurationOrderingViolation { captured_by: Vec<SlotName> },

    /// A slot name string did not match any registry slot.
    #[error("unknown slot: {name}")]
    UnknownSlot { name: String },

    // -- Configuration errors -----------------------------------------------
    /// The service environment could not be read or parsed.
    #[error("invalid service environment: {0}")]
    Config(String),
}

impl RuntimeError {
    /// Wrap a library error as a build failure of `slot`.
    pub fn build(slot: SlotName) -> impl FnOnce(BoxError) -> Self {
        move |source| Self::SlotBuild { slot, source }
    }
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
