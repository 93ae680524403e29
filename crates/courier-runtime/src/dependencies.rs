//! Lazily built service handles for one account session.
//!
//! [`Dependencies`] owns one [`Slot`] per service handle. Each accessor
//! returns the cached handle or builds it through the [`ServiceFactory`],
//! resolving the handle's own dependencies through the other accessors first.
//! The slot graph is fixed in code and acyclic:
//!
//! ```text
//! zkOperations ── groupOperations ─┬─ accountManager ─┬─ groupsApi
//!                                  │                  ├─ keyBackupService
//!                                  │                  └─ secureValueRecovery
//! transport ───────────────────────┼─ messageReceiver ── profileService
//!                                  └─ messageSender
//! cipher
//! ```
//!
//! Builders hold their own slot's build mutex while resolving dependencies,
//! so locks are always taken in edge order and never re-entered.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use crate::config::{RegistryConfiguration, ServiceEnvironment};
use crate::error::{Result, RuntimeError};
use crate::services::{HealthMonitor, ServiceFactory, Transport};
use crate::slot::{AnySlot, Slot, SlotName};

/// Current options plus the slots whose cached values were built from them.
#[derive(Debug, Default)]
struct ConfigurationState {
    options: RegistryConfiguration,
    captured_by: Vec<SlotName>,
}

/// Registry of lazily constructed service handles.
///
/// All methods take `&self`; share the registry behind an `Arc`.
pub struct Dependencies<F: ServiceFactory> {
    environment: ServiceEnvironment,
    factory: F,
    configuration: Mutex<ConfigurationState>,

    zk_operations: Slot<F::ZkOperations>,
    group_operations: Slot<F::GroupOperations>,
    transport: Slot<F::Transport>,
    account_manager: Slot<F::AccountManager>,
    groups_api: Slot<F::GroupsApi>,
    message_receiver: Slot<F::MessageReceiver>,
    message_sender: Slot<F::MessageSender>,
    key_backup_service: Slot<F::KeyBackupService>,
    secure_value_recovery: Slot<F::SecureValueRecovery>,
    profile_service: Slot<F::ProfileService>,
    cipher: Slot<F::Cipher>,
}

impl<F: ServiceFactory> Dependencies<F> {
    /// Create an empty registry. Nothing is built until first use.
    pub fn new(environment: ServiceEnvironment, factory: F) -> Self {
        info!(environment = %environment.name, "service registry created");
        Self {
            environment,
            factory,
            configuration: Mutex::new(ConfigurationState::default()),
            zk_operations: Slot::new(SlotName::ZkOperations),
            group_operations: Slot::new(SlotName::GroupOperations),
            transport: Slot::new(SlotName::Transport),
            account_manager: Slot::new(SlotName::AccountManager),
            groups_api: Slot::new(SlotName::GroupsApi),
            message_receiver: Slot::new(SlotName::MessageReceiver),
            message_sender: Slot::new(SlotName::MessageSender),
            key_backup_service: Slot::new(SlotName::KeyBackupService),
            secure_value_recovery: Slot::new(SlotName::SecureValueRecovery),
            profile_service: Slot::new(SlotName::ProfileService),
            cipher: Slot::new(SlotName::Cipher),
        }
    }

    pub fn environment(&self) -> &ServiceEnvironment {
        &self.environment
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    // -- configuration ------------------------------------------------------

    /// Options currently set on the registry.
    pub fn configuration(&self) -> RegistryConfiguration {
        self.lock_configuration().options
    }

    /// Replace the registry options.
    ///
    /// Call this before the first access to any slot that reads the options
    /// (currently the transport). Changing them while such a slot is built
    /// is refused with [`RuntimeError::ConfigurationOrderingViolation`]; the
    /// built slot keeps the options it was built with. Setting the same
    /// options again is always accepted.
    pub fn set_configuration(&self, options: RegistryConfiguration) -> Result<()> {
        let mut state = self.lock_configuration();
        if state.options == options {
            return Ok(());
        }
        if !state.captured_by.is_empty() {
            error!(
                captured_by = ?state.captured_by,
                current = ?state.options,
                requested = ?options,
                "registry configuration changed after it was read by a built slot"
            );
            return Err(RuntimeError::ConfigurationOrderingViolation {
                captured_by: state.captured_by.clone(),
            });
        }
        state.options = options;
        Ok(())
    }

    /// Read the options on behalf of `slot`, pinning them until the slot is
    /// invalidated or its build fails.
    fn capture_configuration(&self, slot: SlotName) -> RegistryConfiguration {
        let mut state = self.lock_configuration();
        if !state.captured_by.contains(&slot) {
            state.captured_by.push(slot);
        }
        state.options
    }

    fn release_configuration(&self, slot: SlotName) {
        self.lock_configuration().captured_by.retain(|s| *s != slot);
    }

    fn lock_configuration(&self) -> MutexGuard<'_, ConfigurationState> {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -- slots --------------------------------------------------------------

    pub fn zk_operations(&self) -> Result<Arc<F::ZkOperations>> {
        self.zk_operations.get_or_try_init(|| {
            let zk = self
                .factory
                .zk_operations(&self.environment)
                .map_err(RuntimeError::build(SlotName::ZkOperations))?;
            Ok(Arc::new(zk))
        })
    }

    pub fn group_operations(&self) -> Result<Arc<F::GroupOperations>> {
        self.group_operations.get_or_try_init(|| {
            let zk = self.zk_operations()?;
            let groups = self
                .factory
                .group_operations(&self.environment, zk)
                .map_err(RuntimeError::build(SlotName::GroupOperations))?;
            Ok(Arc::new(groups))
        })
    }

    /// The websocket transport, wired to a fresh health monitor.
    pub fn transport(&self) -> Result<Arc<F::Transport>> {
        self.transport.get_or_try_init(|| {
            let options = self.capture_configuration(SlotName::Transport);
            let built = self.build_transport(options);
            if built.is_err() {
                self.release_configuration(SlotName::Transport);
            }
            built
        })
    }

    fn build_transport(&self, options: RegistryConfiguration) -> Result<Arc<F::Transport>> {
        let monitor = self
            .factory
            .health_monitor(&self.environment)
            .map_err(RuntimeError::build(SlotName::Transport))?;
        let monitor = Arc::new(monitor);

        let transport = self
            .factory
            .transport(&self.environment, options, Arc::clone(&monitor))
            .map_err(RuntimeError::build(SlotName::Transport))?;
        let transport = Arc::new(transport);

        monitor.monitor(Arc::downgrade(&transport));
        Ok(transport)
    }

    pub fn account_manager(&self) -> Result<Arc<F::AccountManager>> {
        self.account_manager.get_or_try_init(|| {
            let groups = self.group_operations()?;
            let manager = self
                .factory
                .account_manager(&self.environment, groups)
                .map_err(RuntimeError::build(SlotName::AccountManager))?;
            Ok(Arc::new(manager))
        })
    }

    pub fn groups_api(&self) -> Result<Arc<F::GroupsApi>> {
        self.groups_api.get_or_try_init(|| {
            let manager = self.account_manager()?;
            let api = self
                .factory
                .groups_api(&manager)
                .map_err(RuntimeError::build(SlotName::GroupsApi))?;
            Ok(Arc::new(api))
        })
    }

    pub fn message_receiver(&self) -> Result<Arc<F::MessageReceiver>> {
        self.message_receiver.get_or_try_init(|| {
            let transport = self.transport()?;
            let groups = self.group_operations()?;
            let receiver = self
                .factory
                .message_receiver(&self.environment, transport, groups)
                .map_err(RuntimeError::build(SlotName::MessageReceiver))?;
            Ok(Arc::new(receiver))
        })
    }

    pub fn message_sender(&self) -> Result<Arc<F::MessageSender>> {
        self.message_sender.get_or_try_init(|| {
            let transport = self.transport()?;
            let groups = self.group_operations()?;
            let sender = self
                .factory
                .message_sender(&self.environment, transport, groups)
                .map_err(RuntimeError::build(SlotName::MessageSender))?;
            Ok(Arc::new(sender))
        })
    }

    /// Key backup service for the primary enclave.
    pub fn key_backup_service(&self) -> Result<Arc<F::KeyBackupService>> {
        self.key_backup_service.get_or_try_init(|| {
            let manager = self.account_manager()?;
            let service = self
                .factory
                .key_backup_service(&manager, &self.environment.key_backup)
                .map_err(RuntimeError::build(SlotName::KeyBackupService))?;
            Ok(Arc::new(service))
        })
    }

    pub fn secure_value_recovery(&self) -> Result<Arc<F::SecureValueRecovery>> {
        self.secure_value_recovery.get_or_try_init(|| {
            let manager = self.account_manager()?;
            let svr = self
                .factory
                .secure_value_recovery(&manager, &self.environment.svr2_mrenclave)
                .map_err(RuntimeError::build(SlotName::SecureValueRecovery))?;
            Ok(Arc::new(svr))
        })
    }

    pub fn profile_service(&self) -> Result<Arc<F::ProfileService>> {
        self.profile_service.get_or_try_init(|| {
            let groups = self.group_operations()?;
            let receiver = self.message_receiver()?;
            let transport = self.transport()?;
            let service = self
                .factory
                .profile_service(groups, receiver, transport)
                .map_err(RuntimeError::build(SlotName::ProfileService))?;
            Ok(Arc::new(service))
        })
    }

    pub fn cipher(&self) -> Result<Arc<F::Cipher>> {
        self.cipher.get_or_try_init(|| {
            let cipher = self
                .factory
                .cipher(&self.environment)
                .map_err(RuntimeError::build(SlotName::Cipher))?;
            Ok(Arc::new(cipher))
        })
    }

    // -- uncached handles ---------------------------------------------------

    /// A fresh account manager without credentials, for registration and
    /// verification. Never cached.
    pub fn unauthenticated_account_manager(
        &self,
        number: &str,
        password: &str,
    ) -> Result<F::AccountManager> {
        self.factory
            .unauthenticated_account_manager(&self.environment, number, password)
            .map_err(RuntimeError::build(SlotName::AccountManager))
    }

    /// One key backup service per fallback enclave, built on every call.
    pub fn fallback_key_backup_services(&self) -> Result<Vec<F::KeyBackupService>> {
        let manager = self.account_manager()?;
        self.environment
            .fallback_key_backups
            .iter()
            .map(|config| {
                self.factory
                    .key_backup_service(&manager, config)
                    .map_err(RuntimeError::build(SlotName::KeyBackupService))
            })
            .collect()
    }

    // -- invalidation -------------------------------------------------------

    /// Drop the cached values of exactly `slots`; they are rebuilt on next use.
    ///
    /// Handles already given out, and other slots built on top of the
    /// dropped ones, keep working with the old values. Waits for in-flight
    /// builds of the named slots. Must not be called from inside a factory
    /// method.
    pub fn invalidate(&self, slots: &[SlotName]) {
        for &name in slots {
            // The capture is released before another build of the slot can
            // start, so a rebuild always registers its own capture.
            let cleared = self
                .slot(name)
                .clear_with(&mut || self.release_configuration(name));
            if cleared {
                info!(slot = %name, "slot invalidated");
            }
        }
    }

    /// Reset after the account's number or linked-device identity changed.
    ///
    /// Drops the identity-bound sender and cipher and, if a transport is
    /// already open, forces it to reconnect with the new credentials. A
    /// transport that was never built is left unbuilt.
    pub fn reset_after_address_change(&self) {
        info!("account address changed, resetting identity-bound services");
        self.invalidate(&SlotName::IDENTITY_BOUND);
        if let Some(transport) = self.transport.get() {
            transport.force_new_connections();
        }
    }

    // -- introspection ------------------------------------------------------

    pub fn is_built(&self, slot: SlotName) -> bool {
        self.slot(slot).is_built()
    }

    /// How many times `slot` has been constructed, across invalidations.
    pub fn build_count(&self, slot: SlotName) -> u64 {
        self.slot(slot).build_count()
    }

    pub fn built_slots(&self) -> Vec<SlotName> {
        SlotName::ALL
            .into_iter()
            .filter(|name| self.is_built(*name))
            .collect()
    }

    fn slot(&self, name: SlotName) -> &dyn AnySlot {
        match name {
            SlotName::ZkOperations => &self.zk_operations,
            SlotName::GroupOperations => &self.group_operations,
            SlotName::Transport => &self.transport,
            SlotName::AccountManager => &self.account_manager,
            SlotName::GroupsApi => &self.groups_api,
            SlotName::MessageReceiver => &self.message_receiver,
            SlotName::MessageSender => &self.message_sender,
            SlotName::KeyBackupService => &self.key_backup_service,
            SlotName::SecureValueRecovery => &self.secure_value_recovery,
            SlotName::ProfileService => &self.profile_service,
            SlotName::Cipher => &self.cipher,
        }
    }
}

impl<F: ServiceFactory> fmt::Debug for Dependencies<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("environment", &self.environment.name)
            .field("configuration", &self.configuration())
            .field("built", &self.built_slots())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use super::*;
    use crate::config::KeyBackupConfig;
    use crate::services::BuildResult;

    /// One handle type for every slot; `id` is unique per construction.
    #[derive(Debug)]
    struct Handle {
        id: u64,
        allow_stories: bool,
        reconnects: AtomicU64,
    }

    impl Transport for Handle {
        fn force_new_connections(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl HealthMonitor<Handle> for Handle {
        fn monitor(&self, _transport: Weak<Handle>) {}
    }

    #[derive(Default)]
    struct Factory {
        next_id: AtomicU64,
        fail_transport: AtomicBool,
    }

    impl Factory {
        fn handle(&self) -> Handle {
            self.handle_with(true)
        }

        fn handle_with(&self, allow_stories: bool) -> Handle {
            Handle {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                allow_stories,
                reconnects: AtomicU64::new(0),
            }
        }
    }

    impl ServiceFactory for Factory {
        type ZkOperations = Handle;
        type GroupOperations = Handle;
        type HealthMonitor = Handle;
        type Transport = Handle;
        type AccountManager = Handle;
        type GroupsApi = Handle;
        type MessageReceiver = Handle;
        type MessageSender = Handle;
        type KeyBackupService = Handle;
        type SecureValueRecovery = Handle;
        type ProfileService = Handle;
        type Cipher = Handle;

        fn zk_operations(&self, _: &ServiceEnvironment) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn group_operations(&self, _: &ServiceEnvironment, _: Arc<Handle>) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn health_monitor(&self, _: &ServiceEnvironment) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn transport(
            &self,
            _: &ServiceEnvironment,
            options: RegistryConfiguration,
            _: Arc<Handle>,
        ) -> BuildResult<Handle> {
            if self.fail_transport.load(Ordering::SeqCst) {
                return Err("websocket handshake failed".into());
            }
            Ok(self.handle_with(options.allow_stories))
        }
        fn account_manager(&self, _: &ServiceEnvironment, _: Arc<Handle>) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn unauthenticated_account_manager(
            &self,
            _: &ServiceEnvironment,
            _: &str,
            _: &str,
        ) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn groups_api(&self, _: &Handle) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn message_receiver(
            &self,
            _: &ServiceEnvironment,
            _: Arc<Handle>,
            _: Arc<Handle>,
        ) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn message_sender(
            &self,
            _: &ServiceEnvironment,
            _: Arc<Handle>,
            _: Arc<Handle>,
        ) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn key_backup_service(&self, _: &Handle, _: &KeyBackupConfig) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn secure_value_recovery(&self, _: &Handle, _: &str) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn profile_service(
            &self,
            _: Arc<Handle>,
            _: Arc<Handle>,
            _: Arc<Handle>,
        ) -> BuildResult<Handle> {
            Ok(self.handle())
        }
        fn cipher(&self, _: &ServiceEnvironment) -> BuildResult<Handle> {
            Ok(self.handle())
        }
    }

    fn environment() -> ServiceEnvironment {
        ServiceEnvironment::from_toml_str(
            r#"
            name = "test"
            service_url = "https://chat.test.invalid"
            unidentified_sender_trust_root = "AAAA"
            svr2_mrenclave = "00"

            [key_backup]
            enclave_name = "kb"
            service_id = "kb"
            mrenclave = "kb"
            "#,
        )
        .unwrap()
    }

    fn registry() -> Dependencies<Factory> {
        Dependencies::new(environment(), Factory::default())
    }

    #[test]
    fn nothing_is_built_up_front() {
        let deps = registry();
        assert!(deps.built_slots().is_empty());
    }

    #[test]
    fn building_a_slot_builds_its_dependencies() {
        let deps = registry();
        deps.profile_service().unwrap();

        assert_eq!(
            deps.built_slots(),
            vec![
                SlotName::ZkOperations,
                SlotName::GroupOperations,
                SlotName::Transport,
                SlotName::MessageReceiver,
                SlotName::ProfileService,
            ]
        );
    }

    #[test]
    fn shared_dependencies_are_built_once() {
        let deps = registry();
        deps.message_sender().unwrap();
        deps.message_receiver().unwrap();
        deps.account_manager().unwrap();

        assert_eq!(deps.build_count(SlotName::Transport), 1);
        assert_eq!(deps.build_count(SlotName::GroupOperations), 1);
        assert_eq!(deps.build_count(SlotName::ZkOperations), 1);
    }

    #[test]
    fn transport_failure_is_not_cached() {
        let deps = registry();
        deps.factory().fail_transport.store(true, Ordering::SeqCst);

        let err = deps.message_sender().unwrap_err();
        assert!(matches!(err, RuntimeError::SlotBuild { slot: SlotName::Transport, .. }));
        assert!(!deps.is_built(SlotName::Transport));
        assert!(!deps.is_built(SlotName::MessageSender));
        // A failed transport build does not pin the configuration.
        deps.set_configuration(RegistryConfiguration {
            allow_stories: false,
        })
        .unwrap();

        deps.factory().fail_transport.store(false, Ordering::SeqCst);
        deps.message_sender().unwrap();
        assert!(!deps.transport().unwrap().allow_stories);
    }

    #[test]
    fn invalidate_releases_captured_configuration() {
        let deps = registry();
        assert!(deps.transport().unwrap().allow_stories);

        let off = RegistryConfiguration {
            allow_stories: false,
        };
        assert!(deps.set_configuration(off).is_err());

        deps.invalidate(&[SlotName::Transport]);
        deps.set_configuration(off).unwrap();
        assert!(!deps.transport().unwrap().allow_stories);
    }

    /// Sleeps on every event so that work following a log call on the
    /// current thread is delayed.
    struct SlowSubscriber;

    impl tracing::Subscriber for SlowSubscriber {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }
        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}
        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}
        fn event(&self, _: &tracing::Event<'_>) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        fn enter(&self, _: &tracing::span::Id) {}
        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[test]
    fn transport_rebuilt_during_invalidate_keeps_its_capture() {
        let deps = Arc::new(registry());
        deps.transport().unwrap();

        let rebuilder = {
            let deps = Arc::clone(&deps);
            std::thread::spawn(move || {
                while deps.is_built(SlotName::Transport) {
                    std::thread::yield_now();
                }
                deps.transport().unwrap()
            })
        };

        tracing::subscriber::with_default(SlowSubscriber, || {
            deps.invalidate(&[SlotName::Transport]);
        });
        let rebuilt = rebuilder.join().unwrap();

        assert!(rebuilt.allow_stories);
        assert!(Arc::ptr_eq(&rebuilt, &deps.transport().unwrap()));
        let err = deps
            .set_configuration(RegistryConfiguration {
                allow_stories: false,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ConfigurationOrderingViolation { ref captured_by }
                if captured_by == &[SlotName::Transport]
        ));
        assert!(deps.configuration().allow_stories);
    }

    #[test]
    fn reset_only_reconnects_an_open_transport() {
        let deps = registry();
        deps.cipher().unwrap();
        deps.reset_after_address_change();
        assert!(!deps.is_built(SlotName::Transport));
        assert!(!deps.is_built(SlotName::Cipher));

        let transport = deps.transport().unwrap();
        deps.reset_after_address_change();
        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&transport, &deps.transport().unwrap()));
    }

    #[test]
    fn uncached_handles_are_fresh_each_call() {
        let deps = registry();
        let a = deps.unauthenticated_account_manager("+15550100", "secret").unwrap();
        let b = deps.unauthenticated_account_manager("+15550100", "secret").unwrap();
        assert_ne!(a.id, b.id);
        assert!(!deps.is_built(SlotName::AccountManager));

        // No fallback enclaves configured.
        assert!(deps.fallback_key_backup_services().unwrap().is_empty());
        assert!(deps.is_built(SlotName::AccountManager));
    }
}
