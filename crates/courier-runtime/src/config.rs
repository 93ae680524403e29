//! Service environment and registry configuration.
//!
//! [`ServiceEnvironment`] describes the server deployment the account talks
//! to (endpoints, enclave measurements, limits) and is fixed for the lifetime
//! of a [`Dependencies`](crate::Dependencies) registry. It is usually read
//! from a TOML file:
//!
//! ```toml
//! name = "staging"
//! service_url = "https://chat.staging.example.org"
//! unidentified_sender_trust_root = "BbqY1DzohE4NUZoVF+L18oUPrK3kILllLEJh2UnPSsEx"
//! svr2_mrenclave = "a8a261420a6bb9b61aa25bf8a79e8bd20d7652531feb3381cbffd446d270be95"
//!
//! [key_backup]
//! enclave_name = "e18376436159cda3ad7a45d9320e382e4a497f26b93c11c0b4bd57ab6b3e1f0c"
//! service_id = "038c40bbbacdc873caa81ac793bb75afde6dfe436a99ab1f15e3f0cbb7434ced"
//! mrenclave = "e18376436159cda3ad7a45d9320e382e4a497f26b93c11c0b4bd57ab6b3e1f0c"
//! ```
//!
//! [`RegistryConfiguration`] holds the switches callers may set on the
//! registry before the slots that read them are built.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Key backup enclave coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupConfig {
    pub enclave_name: String,
    pub service_id: String,
    pub mrenclave: String,
    /// Attempts allowed before the backed-up key is wiped.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
}

/// Server deployment the account is registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEnvironment {
    /// Short name used in logs (`"live"`, `"staging"`).
    pub name: String,
    pub service_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Base64 public key that signs sealed-sender certificates.
    pub unidentified_sender_trust_root: String,
    pub key_backup: KeyBackupConfig,
    /// Older enclaves still consulted when restoring a backed-up key.
    #[serde(default)]
    pub fallback_key_backups: Vec<KeyBackupConfig>,
    pub svr2_mrenclave: String,
    #[serde(default = "default_max_group_size")]
    pub max_group_size: u32,
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: u64,
    #[serde(default = "default_true")]
    pub automatic_network_retry: bool,
}

impl ServiceEnvironment {
    /// Parse an environment from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Read and parse an environment file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        let env = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), environment = %env.name, "service environment loaded");
        Ok(env)
    }
}

/// Switches read by slot builders.
///
/// Must be set before the first access to a slot that reads them; see
/// [`Dependencies::set_configuration`](crate::Dependencies::set_configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfiguration {
    /// Whether the transport advertises story support to the server.
    pub allow_stories: bool,
}

impl Default for RegistryConfiguration {
    fn default() -> Self {
        Self {
            allow_stories: true,
        }
    }
}

fn default_user_agent() -> String {
    concat!("courier/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_tries() -> u32 {
    10
}

fn default_max_group_size() -> u32 {
    1001
}

fn default_max_envelope_size() -> u64 {
    256 * 1024
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
