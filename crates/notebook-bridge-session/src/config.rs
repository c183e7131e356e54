//! Bridge configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every field has a default, so an empty or missing file is a
//! valid configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use notebook_bridge_core::{Credential, ServerAddress};
use notebook_bridge_kernel::KernelClientConfig;
use serde::{Deserialize, Serialize};

use crate::supervisor::RetryPolicy;

/// Server address override.
pub const ENV_URL: &str = "NOTEBOOK_BRIDGE_URL";
/// Credential override.
pub const ENV_TOKEN: &str = "NOTEBOOK_BRIDGE_TOKEN";
/// Kernel name override.
pub const ENV_KERNEL: &str = "NOTEBOOK_BRIDGE_KERNEL";

const SESSION_FILE_NAME: &str = ".notebook-bridge-session.json";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Kernel spec name used when a kernel has to be started.
    pub name: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub drain_grace_ms: u64,
    pub retired_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            drain_grace_ms: 10_000,
            retired_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub kernel: KernelConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    /// Where the saved session lives. Defaults to a file in the home dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
}

impl BridgeConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns `Parse` on invalid TOML or mistyped fields.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a file. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns `Io` if the file exists but cannot be read, `Parse` if it is
    /// not valid configuration.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from an optional file, then apply environment overrides.
    ///
    /// # Errors
    /// See [`Self::load_from`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_URL) {
            self.server.address = Some(url);
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.server.token = Some(token);
        }
        if let Some(kernel) = non_empty(ENV_KERNEL) {
            self.kernel.name = kernel;
        }
    }

    /// Server address and credential.
    ///
    /// # Errors
    /// Returns `Missing` if either is unset.
    pub fn credentials(&self) -> Result<(ServerAddress, Credential), ConfigError> {
        let address = self
            .server
            .address
            .as_deref()
            .ok_or(ConfigError::Missing("server.address"))?;
        let token = self
            .server
            .token
            .as_deref()
            .ok_or(ConfigError::Missing("server.token"))?;
        Ok((ServerAddress::new(address), Credential::new(token)))
    }

    /// Kernel client settings derived from the `execution` section.
    #[must_use]
    pub fn kernel_client(&self) -> KernelClientConfig {
        KernelClientConfig {
            default_timeout: Duration::from_secs(self.execution.timeout_secs),
            drain_grace: Duration::from_millis(self.execution.drain_grace_ms),
            retired_capacity: self.execution.retired_capacity,
            ..KernelClientConfig::default()
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Saved-session file path, if one can be determined.
    #[must_use]
    pub fn session_file(&self) -> Option<PathBuf> {
        self.session_file
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(SESSION_FILE_NAME)))
    }
}
