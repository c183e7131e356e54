//! Execution request lifecycle and results.

use std::{sync::Arc, time::Duration, time::Instant};

use notebook_bridge_core::{CorrelationToken, Output, OutputStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::client::{KernelClient, KernelError};

/// Lifecycle of an execution request.
///
/// `Queued -> Dispatched -> Collecting -> Finalized | Cancelled | Failed`.
/// A queued request may go straight to `Cancelled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Dispatched,
    Collecting,
    Finalized,
    Cancelled,
    Failed,
}

impl RequestState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled | Self::Failed)
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The code raised. A meaningful result, never retried.
    #[error("{kind}: {message}")]
    ExecutionError {
        #[serde(rename = "error_kind")]
        kind: String,
        message: String,
        trace: Vec<String>,
    },
    /// The deadline passed and the kernel was interrupted.
    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    /// Malformed or out-of-sequence kernel messages, or a kernel restart.
    ///
    /// `restarted` marks work dropped by a restart. The code may have
    /// partly run, so it is not a transport fault and never retried.
    #[error("Protocol error: {detail}")]
    Protocol {
        detail: String,
        #[serde(default)]
        restarted: bool,
    },
    /// The kernel channel went away.
    #[error("Kernel unreachable: {detail}")]
    Unreachable { detail: String },
}

impl ExecutionFailure {
    /// Whether the failure happened at the transport level.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                restarted: false,
                ..
            } | Self::Unreachable { .. }
        )
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
            restarted: false,
        }
    }

    pub(crate) fn restarted(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
            restarted: true,
        }
    }

    pub(crate) fn unreachable(detail: impl Into<String>) -> Self {
        Self::Unreachable {
            detail: detail.into(),
        }
    }
}

/// Terminal state of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Finalized,
    Cancelled,
    Failed { failure: ExecutionFailure },
}

impl TerminalState {
    #[must_use]
    pub const fn failed(failure: ExecutionFailure) -> Self {
        Self::Failed { failure }
    }

    #[must_use]
    pub const fn request_state(&self) -> RequestState {
        match self {
            Self::Finalized => RequestState::Finalized,
            Self::Cancelled => RequestState::Cancelled,
            Self::Failed { .. } => RequestState::Failed,
        }
    }

    #[must_use]
    pub const fn failure(&self) -> Option<&ExecutionFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// Finalized outcome of one execution request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub token: CorrelationToken,
    /// Outputs in kernel emission order.
    pub outputs: Vec<Output>,
    pub execution_count: Option<u32>,
    pub terminal: TerminalState,
    /// Set when collection stopped early (cancel or timeout).
    pub partial: bool,
    /// Content messages drained and discarded after a stop was requested.
    pub discarded: usize,
    pub submitted_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub finished_at: Instant,
}

impl ExecutionResult {
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.terminal, TerminalState::Finalized)
    }

    /// Time from submission to the terminal state.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.submitted_at)
    }

    pub(crate) fn unsent(
        token: CorrelationToken,
        submitted_at: Instant,
        terminal: TerminalState,
    ) -> Self {
        Self {
            token,
            outputs: Vec::new(),
            execution_count: None,
            terminal,
            partial: false,
            discarded: 0,
            submitted_at,
            dispatched_at: None,
            finished_at: Instant::now(),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Deadline measured from dispatch. Falls back to the client default.
    pub timeout: Option<Duration>,
    /// Refuse to queue behind other work; fail with `KernelBusy` instead.
    pub exclusive: bool,
}

impl ExecuteOptions {
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            exclusive: false,
        }
    }

    #[must_use]
    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Caller-side view of a submitted request.
pub struct ExecutionHandle {
    pub(crate) token: CorrelationToken,
    pub(crate) state: watch::Receiver<RequestState>,
    pub(crate) outputs: Arc<OutputStore>,
    pub(crate) result: oneshot::Receiver<ExecutionResult>,
    pub(crate) client: KernelClient,
}

impl ExecutionHandle {
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RequestState> {
        self.state.clone()
    }

    /// Live and buffered outputs of this request.
    #[must_use]
    pub fn outputs(&self) -> Arc<OutputStore> {
        Arc::clone(&self.outputs)
    }

    /// Suspend until the state satisfies `pred`; returns that state.
    ///
    /// # Errors
    /// Returns `Closed` if the client stopped before the state was reached.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&RequestState) -> bool,
    ) -> Result<RequestState, KernelError> {
        self.state
            .wait_for(pred)
            .await
            .map(|state| *state)
            .map_err(|_| KernelError::Closed)
    }

    /// Request cancellation. Observe the outcome through [`Self::wait`].
    ///
    /// # Errors
    /// Returns `Closed` if the client has stopped.
    pub async fn cancel(&self) -> Result<(), KernelError> {
        self.client.cancel(&self.token).await
    }

    /// Suspend until the request reaches a terminal state.
    ///
    /// # Errors
    /// Returns `Closed` if the client stopped without finalizing it.
    pub async fn wait(self) -> Result<ExecutionResult, KernelError> {
        self.result.await.map_err(|_| KernelError::Closed)
    }
}
