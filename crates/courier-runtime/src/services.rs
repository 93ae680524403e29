//! Boundary to the external messaging library.
//!
//! The registry never constructs protocol objects itself. It asks a
//! [`ServiceFactory`] for each handle and passes in the dependencies it has
//! already resolved from other slots, so a factory method never reaches back
//! into the registry. Credentials, the protocol data store, the session lock
//! and any executor belong to the factory; methods that read identity-derived
//! state (sender, cipher) must read the factory's *current* identity so a
//! rebuild after an address change picks up the new one.

use std::sync::{Arc, Weak};

use crate::config::{KeyBackupConfig, RegistryConfiguration, ServiceEnvironment};
use crate::error::BoxError;

/// Result type of every factory method.
pub type BuildResult<T> = std::result::Result<T, BoxError>;

/// A long-lived authenticated/unidentified websocket pair.
pub trait Transport: Send + Sync + 'static {
    /// Drop the open connections; the next request reconnects with the
    /// account's current credentials.
    fn force_new_connections(&self);
}

/// Keep-alive and health observer attached to a transport.
///
/// The monitor is created first and handed to the transport constructor;
/// once the transport exists the registry tells the monitor to watch it.
pub trait HealthMonitor<T>: Send + Sync + 'static {
    fn monitor(&self, transport: Weak<T>);
}

/// Constructors for every service handle held by the registry.
pub trait ServiceFactory: Send + Sync + 'static {
    type ZkOperations: Send + Sync + 'static;
    type GroupOperations: Send + Sync + 'static;
    type HealthMonitor: HealthMonitor<Self::Transport>;
    type Transport: Transport;
    type AccountManager: Send + Sync + 'static;
    type GroupsApi: Send + Sync + 'static;
    type MessageReceiver: Send + Sync + 'static;
    type MessageSender: Send + Sync + 'static;
    type KeyBackupService: Send + Sync + 'static;
    type SecureValueRecovery: Send + Sync + 'static;
    type ProfileService: Send + Sync + 'static;
    type Cipher: Send + Sync + 'static;

    /// Zero-knowledge group and profile credential operations.
    fn zk_operations(&self, env: &ServiceEnvironment) -> BuildResult<Self::ZkOperations>;

    fn group_operations(
        &self,
        env: &ServiceEnvironment,
        zk: Arc<Self::ZkOperations>,
    ) -> BuildResult<Self::GroupOperations>;

    fn health_monitor(&self, env: &ServiceEnvironment) -> BuildResult<Self::HealthMonitor>;

    /// Build the transport. `options` are the registry options captured for
    /// this build and must be treated as fixed.
    fn transport(
        &self,
        env: &ServiceEnvironment,
        options: RegistryConfiguration,
        monitor: Arc<Self::HealthMonitor>,
    ) -> BuildResult<Self::Transport>;

    fn account_manager(
        &self,
        env: &ServiceEnvironment,
        groups: Arc<Self::GroupOperations>,
    ) -> BuildResult<Self::AccountManager>;

    /// An account manager for registration, before credentials exist.
    fn unauthenticated_account_manager(
        &self,
        env: &ServiceEnvironment,
        number: &str,
        password: &str,
    ) -> BuildResult<Self::AccountManager>;

    fn groups_api(&self, account_manager: &Self::AccountManager) -> BuildResult<Self::GroupsApi>;

    fn message_receiver(
        &self,
        env: &ServiceEnvironment,
        transport: Arc<Self::Transport>,
        groups: Arc<Self::GroupOperations>,
    ) -> BuildResult<Self::MessageReceiver>;

    fn message_sender(
        &self,
        env: &ServiceEnvironment,
        transport: Arc<Self::Transport>,
        groups: Arc<Self::GroupOperations>,
    ) -> BuildResult<Self::MessageSender>;

    fn key_backup_service(
        &self,
        account_manager: &Self::AccountManager,
        config: &KeyBackupConfig,
    ) -> BuildResult<Self::KeyBackupService>;

    fn secure_value_recovery(
        &self,
        account_manager: &Self::AccountManager,
        mrenclave: &str,
    ) -> BuildResult<Self::SecureValueRecovery>;

    fn profile_service(
        &self,
        groups: Arc<Self::GroupOperations>,
        receiver: Arc<Self::MessageReceiver>,
        transport: Arc<Self::Transport>,
    ) -> BuildResult<Self::ProfileService>;

    /// Sealed-sender cipher bound to the current identity, validating
    /// certificates against `env.unidentified_sender_trust_root`.
    fn cipher(&self, env: &ServiceEnvironment) -> BuildResult<Self::Cipher>;
}
