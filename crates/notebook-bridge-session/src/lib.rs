//! Notebook bridge sessions.
//!
//! Provides:
//! - `SessionManager` - connection lifecycle, one session at a time
//! - `Session` - conflict-aware document edits and cell execution
//! - `ExecutionSupervisor` - bounded retry of transport faults
//! - `BridgeConfig` - TOML + environment configuration
//! - Saved-session stores (memory, JSON file)

pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod storage;
pub mod supervisor;

pub use config::{BridgeConfig, ConfigError};
pub use error::SessionError;
pub use manager::SessionManager;
pub use session::{Applied, CellExecution, DiffReport, Session};
pub use storage::{FileSessionStore, SavedSession, SessionStore, StoreError};
#[cfg(feature = "memory")]
pub use storage::MemorySessionStore;
pub use supervisor::{AttemptFailure, ExecutionSupervisor, RetryPolicy, SupervisorError};
