//! Saved-session storage.
//!
//! A saved session is what `reconnect_saved` needs to find the same server,
//! notebook and kernel again after the process restarts.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use notebook_bridge_core::{Credential, KernelId, ServerAddress};
use serde::{Deserialize, Serialize};

pub mod file;
#[cfg(feature = "memory")]
pub mod memory;

pub use file::FileSessionStore;
#[cfg(feature = "memory")]
pub use memory::MemorySessionStore;

/// Storage error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt saved session: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connection parameters of the last live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub address: ServerAddress,
    pub credential: Credential,
    #[serde(default)]
    pub notebook_path: Option<String>,
    #[serde(default)]
    pub kernel_id: Option<KernelId>,
    pub kernel_name: String,
    /// Unix seconds.
    #[serde(default)]
    pub saved_at: u64,
}

impl SavedSession {
    #[must_use]
    pub fn new(address: ServerAddress, credential: Credential, kernel_name: impl Into<String>) -> Self {
        Self {
            address,
            credential,
            notebook_path: None,
            kernel_id: None,
            kernel_name: kernel_name.into(),
            saved_at: now(),
        }
    }
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Persists at most one saved session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Replace the saved session.
    async fn save(&self, session: &SavedSession) -> Result<(), StoreError>;

    /// The saved session, if any.
    async fn load(&self) -> Result<Option<SavedSession>, StoreError>;

    /// Forget the saved session.
    async fn clear(&self) -> Result<(), StoreError>;
}
