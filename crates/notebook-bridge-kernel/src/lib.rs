//! Kernel protocol client.
//!
//! Provides:
//! - `KernelClient` - queued, correlated execution over one kernel channel
//! - `ExecutionHandle` / `ExecutionResult` - per-request state and outcome
//! - Cancellation, deadlines and drain of late kernel messages

mod collector;

pub mod client;
pub mod request;

pub use client::{KernelClient, KernelClientConfig, KernelError};
pub use request::{
    ExecuteOptions, ExecutionFailure, ExecutionHandle, ExecutionResult, RequestState,
    TerminalState,
};
