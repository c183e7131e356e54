//! Core building blocks of the notebook bridge.
//!
//! This crate provides:
//! - `Document` - ordered cells with stable identity
//! - `Snapshot` / `diff` - structural change detection
//! - `Output` / `OutputStore` - typed outputs with live broadcast
//! - `KernelMessage` - kernel wire messages
//! - Server and kernel seam traits

pub mod cell;
pub mod context;
pub mod document;
pub mod error;
pub mod kernel_msg;
pub mod output;
pub mod output_store;
pub mod snapshot;
pub mod traits;

pub use cell::{Cell, CellId, CellKind};
pub use context::{Credential, ServerAddress};
pub use document::{CellRecord, CellRef, Document, NotebookFile};
pub use error::{DocumentError, TransportError};
pub use kernel_msg::{Channel, CorrelationToken, ExecutionState, KernelEvent, KernelMessage};
pub use output::{MimeBundle, Output, StreamName};
pub use output_store::{OutputEvent, OutputStore};
pub use snapshot::{CellChange, Snapshot, capture, diff, summarize};
pub use traits::{
    AttachedKernel, KernelChannels, KernelControl, KernelId, KernelInfo, NotebookServer,
    ServerConnector, ServerStatus,
};
