//! Error types shared across the bridge.

use thiserror::Error;

use crate::cell::CellId;

/// Structural document error. Always a caller bug, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("No such cell: {0}")]
    NoSuchCell(CellId),
    #[error("Cell index {index} out of range (document has {len} cells)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Cell {0} is not a code cell")]
    NotCodeCell(CellId),
    #[error("Duplicate cell id: {0}")]
    DuplicateCellId(CellId),
    #[error("Invalid notebook format: {0}")]
    Format(String),
}

/// Failure talking to the notebook server or kernel transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Authentication rejected: {0}")]
    Auth(String),
    #[error("Server unreachable: {0}")]
    Unreachable(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(String),
}

impl TransportError {
    /// Whether a bounded retry may clear this fault.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}
