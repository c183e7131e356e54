//! Notebook server transports.
//!
//! Provides:
//! - `JupyterConnector` - REST + WebSocket client for a Jupyter server
//! - `MemoryConnector` - in-process server and simulated kernel (feature: memory)

pub mod jupyter;

#[cfg(feature = "memory")]
pub mod memory;

pub use jupyter::{JupyterConnector, JupyterServer};

#[cfg(feature = "memory")]
pub use memory::{MEMORY_ADDRESS, MemoryConnector, MemoryServer};
