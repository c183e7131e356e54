//! Bounded retry around session executions.
//!
//! Code that raises is a result, never retried. Only transport-level
//! faults (an unreachable server or kernel, a protocol fault) get another
//! attempt, with exponential backoff. Work dropped by a kernel restart is
//! returned as is. Once the attempts run out the session is closed and
//! the caller has to reconnect.

use std::{future::Future, time::Duration};

use notebook_bridge_core::{CellRef, CorrelationToken};
use notebook_bridge_kernel::{ExecuteOptions, ExecutionFailure, ExecutionResult};
use tokio::time::Instant;

use crate::{error::SessionError, session::Session};

/// Retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The fault that ended an attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Session(SessionError),
    #[error(transparent)]
    Execution(ExecutionFailure),
}

/// Supervisor error.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Every attempt hit a transport fault. The session has been closed.
    #[error("Gave up after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Exhausted {
        attempts: u32,
        /// Token of the last request that reached the kernel.
        last_token: Option<CorrelationToken>,
        elapsed: Duration,
        source: AttemptFailure,
    },
    /// A fault no retry can clear.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SupervisorError {
    #[must_use]
    pub const fn last_token(&self) -> Option<&CorrelationToken> {
        match self {
            Self::Exhausted { last_token, .. } => last_token.as_ref(),
            Self::Session(_) => None,
        }
    }
}

/// Runs executions under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionSupervisor {
    policy: RetryPolicy,
}

impl ExecutionSupervisor {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a cell, retrying transport faults.
    ///
    /// # Errors
    /// `Exhausted` once the bound is hit, after closing `session`.
    /// `Session` for faults that are never retried (bad cell, no kernel,
    /// rejected credential).
    pub async fn execute_cell(
        &self,
        session: &Session,
        target: impl Into<CellRef> + Send,
        code: Option<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, SupervisorError> {
        let target = target.into();
        self.run(session, || {
            session.execute_cell(target.clone(), code.clone(), options)
        })
        .await
    }

    /// Run code outside the document, retrying transport faults.
    ///
    /// # Errors
    /// See [`Self::execute_cell`].
    pub async fn execute_code(
        &self,
        session: &Session,
        code: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, SupervisorError> {
        self.run(session, || session.execute_code(code.to_string(), options))
            .await
    }

    async fn run<F, Fut>(
        &self,
        session: &Session,
        mut attempt: F,
    ) -> Result<ExecutionResult, SupervisorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ExecutionResult, SessionError>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_token = None;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match attempt().await {
                Ok(result) => {
                    let transport = result
                        .terminal
                        .failure()
                        .filter(|f| f.is_transport())
                        .cloned();
                    let Some(failure) = transport else {
                        return Ok(result);
                    };
                    last_token = Some(result.token);
                    AttemptFailure::Execution(failure)
                }
                Err(e) if e.is_transient() => AttemptFailure::Session(e),
                Err(e) => return Err(e.into()),
            };

            if attempts >= max_attempts {
                let elapsed = started.elapsed();
                tracing::error!(
                    attempts,
                    last_token = ?last_token,
                    ?elapsed,
                    "Execution retries exhausted, closing session: {failure}"
                );
                session.close().await;
                return Err(SupervisorError::Exhausted {
                    attempts,
                    last_token,
                    elapsed,
                    source: failure,
                });
            }

            let delay = self.policy.delay_for(attempts);
            tracing::warn!(attempt = attempts, ?delay, "Transient failure, retrying: {failure}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_none_policy() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert_eq!(RetryPolicy::none().delay_for(1), Duration::ZERO);
    }
}
