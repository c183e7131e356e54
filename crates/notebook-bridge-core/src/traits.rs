//! Seams between the bridge core and the notebook server it talks to.
//!
//! The bridge only ever sees a server through these traits, so the same
//! session and kernel client code runs against a live Jupyter server or an
//! in-process simulator.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    context::{Credential, ServerAddress},
    document::NotebookFile,
    error::TransportError,
    kernel_msg::KernelMessage,
};

/// Server-assigned kernel identifier, reusable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines and messages.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A running kernel as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: KernelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
}

/// Server liveness report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
    #[serde(default)]
    pub kernels: Option<u32>,
}

/// The multiplexed message stream of one kernel.
///
/// Messages sent on `sender` go to the kernel; everything the kernel
/// emits, on any channel, arrives on `receiver` in transport order.
/// The receiver ends when the transport closes.
pub struct KernelChannels {
    pub sender: mpsc::UnboundedSender<KernelMessage>,
    pub receiver: mpsc::UnboundedReceiver<Result<KernelMessage, TransportError>>,
}

/// Establishes authenticated connections to a notebook server.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Connect and verify the credential.
    ///
    /// Fails with `Auth` when the server rejects the credential and with
    /// `Unreachable` when the server cannot be reached at all.
    async fn connect(
        &self,
        address: &ServerAddress,
        credential: &Credential,
    ) -> Result<Arc<dyn NotebookServer>, TransportError>;
}

/// REST and channel operations of a connected notebook server.
#[async_trait]
pub trait NotebookServer: Send + Sync {
    /// Address this connection points at.
    fn address(&self) -> &ServerAddress;

    /// Liveness check.
    async fn status(&self) -> Result<ServerStatus, TransportError>;

    /// Start a bare kernel from a kernel spec name.
    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelInfo, TransportError>;

    /// Look up a kernel; `None` if it no longer exists.
    async fn get_kernel(&self, id: &KernelId) -> Result<Option<KernelInfo>, TransportError>;

    /// Send an interrupt signal to a kernel.
    async fn interrupt_kernel(&self, id: &KernelId) -> Result<(), TransportError>;

    /// Restart a kernel, clearing its state.
    async fn restart_kernel(&self, id: &KernelId) -> Result<(), TransportError>;

    /// Shut a kernel down.
    async fn shutdown_kernel(&self, id: &KernelId) -> Result<(), TransportError>;

    /// Kernel of an existing server session for a notebook path.
    async fn find_session(&self, notebook_path: &str) -> Result<Option<KernelInfo>, TransportError>;

    /// Create a server session (and kernel) for a notebook path.
    async fn create_session(
        &self,
        notebook_path: &str,
        kernel_name: &str,
    ) -> Result<KernelInfo, TransportError>;

    /// Fetch a notebook; `None` if there is no file at `path`.
    async fn get_notebook(&self, path: &str) -> Result<Option<NotebookFile>, TransportError>;

    /// Store a notebook at `path`, creating it if needed.
    async fn save_notebook(&self, path: &str, notebook: &NotebookFile) -> Result<(), TransportError>;

    /// Open the message channels of a kernel.
    async fn open_channels(&self, id: &KernelId) -> Result<KernelChannels, TransportError>;
}

/// Out-of-band control of one kernel.
#[async_trait]
pub trait KernelControl: Send + Sync {
    async fn interrupt(&self) -> Result<(), TransportError>;
}

/// A kernel id bound to the server that owns it.
#[derive(Clone)]
pub struct AttachedKernel {
    server: Arc<dyn NotebookServer>,
    id: KernelId,
}

impl AttachedKernel {
    #[must_use]
    pub fn new(server: Arc<dyn NotebookServer>, id: KernelId) -> Self {
        Self { server, id }
    }

    #[must_use]
    pub const fn id(&self) -> &KernelId {
        &self.id
    }
}

#[async_trait]
impl KernelControl for AttachedKernel {
    async fn interrupt(&self) -> Result<(), TransportError> {
        self.server.interrupt_kernel(&self.id).await
    }
}
