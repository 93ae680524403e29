//! Lazily built, invalidatable service slots.
//!
//! A [`Slot`] holds at most one shared value. The fast path is not lock-free:
//! reading a built slot takes the slot's `RwLock` in shared mode, so readers
//! only wait on a writer storing or clearing that same slot. Construction is serialized by a per-slot
//! build mutex with a re-check after acquiring it, so concurrent callers of
//! [`Slot::get_or_try_init`] run the builder at most once and all observe the
//! same `Arc`. Slots never share locks with one another.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};

// ---------------------------------------------------------------------------
// Slot names
// ---------------------------------------------------------------------------

/// The fixed set of service slots held by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotName {
    ZkOperations,
    GroupOperations,
    Transport,
    AccountManager,
    GroupsApi,
    MessageReceiver,
    MessageSender,
    KeyBackupService,
    SecureValueRecovery,
    ProfileService,
    Cipher,
}

impl SlotName {
    /// Every slot, leaves first.
    pub const ALL: [SlotName; 11] = [
        Self::ZkOperations,
        Self::GroupOperations,
        Self::Transport,
        Self::AccountManager,
        Self::GroupsApi,
        Self::MessageReceiver,
        Self::MessageSender,
        Self::KeyBackupService,
        Self::SecureValueRecovery,
        Self::ProfileService,
        Self::Cipher,
    ];

    /// Slots holding state derived from the account's network identity.
    pub const IDENTITY_BOUND: [SlotName; 2] = [Self::MessageSender, Self::Cipher];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZkOperations => "zkOperations",
            Self::GroupOperations => "groupOperations",
            Self::Transport => "transport",
            Self::AccountManager => "accountManager",
            Self::GroupsApi => "groupsApi",
            Self::MessageReceiver => "messageReceiver",
            Self::MessageSender => "messageSender",
            Self::KeyBackupService => "keyBackupService",
            Self::SecureValueRecovery => "secureValueRecovery",
            Self::ProfileService => "profileService",
            Self::Cipher => "cipher",
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotName {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| RuntimeError::UnknownSlot {
                name: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

enum SlotState<T> {
    Empty,
    Built(Arc<T>),
}

/// A named cell that builds its value on first use and can be cleared.
pub struct Slot<T> {
    name: SlotName,
    state: RwLock<SlotState<T>>,
    build_lock: Mutex<()>,
    builds: AtomicU64,
}

impl<T> Slot<T> {
    pub fn new(name: SlotName) -> Self {
        Self {
            name,
            state: RwLock::new(SlotState::Empty),
            build_lock: Mutex::new(()),
            builds: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> SlotName {
        self.name
    }

    /// The cached value, if built.
    pub fn get(&self) -> Option<Arc<T>> {
        // The state lock is never held while user code runs, so a poisoned
        // lock still guards a consistent value.
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Built(value) => Some(Arc::clone(value)),
            SlotState::Empty => None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.get().is_some()
    }

    /// How many times a value has been constructed for this slot.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Acquire)
    }

    /// Return the cached value, building it with `build` if the slot is empty.
    ///
    /// `build` runs with this slot's build mutex held; it may build *other*
    /// slots but must never come back to this one. A failed build leaves the
    /// slot empty.
    pub fn get_or_try_init<F>(&self, build: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<Arc<T>>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.get() {
            return Ok(value);
        }

        debug!(slot = %self.name, "building slot");
        let value = build().inspect_err(|err| {
            warn!(slot = %self.name, error = %err, "slot build failed");
        })?;

        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            SlotState::Built(Arc::clone(&value));
        self.builds.fetch_add(1, Ordering::Release);
        Ok(value)
    }

    /// Clear the slot, returning the value it held.
    ///
    /// Waits for an in-flight build of this slot to finish first, so a value
    /// built from pre-invalidation state can never land after this returns.
    pub fn invalidate(&self) -> Option<Arc<T>> {
        self.invalidate_with(|| {})
    }

    /// Like [`Slot::invalidate`], running `on_clear` after the slot is
    /// emptied but before the build mutex is released. No build of this slot
    /// can start until `on_clear` returns.
    pub fn invalidate_with(&self, on_clear: impl FnOnce()) -> Option<Arc<T>> {
        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            SlotState::Empty,
        );
        on_clear();
        match previous {
            SlotState::Built(value) => Some(value),
            SlotState::Empty => None,
        }
    }
}

/// Name-addressable view of a slot, independent of its value type.
pub(crate) trait AnySlot {
    fn is_built(&self) -> bool;
    fn build_count(&self) -> u64;
    /// Clear the slot, running `on_clear` under its build mutex; `true` if it
    /// held a value.
    fn clear_with(&self, on_clear: &mut dyn FnMut()) -> bool;
}

impl<T> AnySlot for Slot<T> {
    fn is_built(&self) -> bool {
        Slot::is_built(self)
    }

    fn build_count(&self) -> u64 {
        Slot::build_count(self)
    }

    fn clear_with(&self, on_clear: &mut dyn FnMut()) -> bool {
        self.invalidate_with(on_clear).is_some()
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("built", &self.is_built())
            .field("builds", &self.build_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
