use notebook_bridge_core::{DocumentError, TransportError};
use notebook_bridge_kernel::KernelError;

use crate::storage::StoreError;

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,
    #[error("No kernel attached")]
    NoKernel,
    #[error("No saved session")]
    NoSavedSession,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether a bounded retry may clear this fault.
    ///
    /// A closed kernel client counts: the next attempt reopens the channels.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Kernel(KernelError::Closed) => true,
            _ => false,
        }
    }
}
