//! Cells and their stable identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::output::Output;

/// Position-independent, immutable identity of a cell.
///
/// Fresh ids come from v4 UUIDs and are never reused. Ids read from a
/// notebook file are kept when they satisfy the nbformat id rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Generate a new, never-before-seen id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept an id from a notebook file if it is well formed.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = (1..=64).contains(&raw.len())
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a cell. Markdown and raw cells are both narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    #[must_use]
    pub const fn is_code(self) -> bool {
        matches!(self, Self::Code)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic document unit.
///
/// A cell does not know its position; that is derived from where it sits
/// in the owning [`Document`](crate::Document).
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub(crate) id: CellId,
    pub(crate) kind: CellKind,
    pub(crate) source: String,
    pub(crate) outputs: Vec<Output>,
    pub(crate) execution_count: Option<u32>,
    pub(crate) metadata: Map<String, Value>,
}

impl Cell {
    pub(crate) fn new(id: CellId, kind: CellKind, source: String) -> Self {
        Self {
            id,
            kind,
            source,
            outputs: Vec::new(),
            execution_count: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &CellId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> CellKind {
        self.kind
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Outputs of the last execution. Always empty for narrative cells.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Kernel-assigned ordinal of the last execution.
    #[must_use]
    pub const fn execution_count(&self) -> Option<u32> {
        self.execution_count
    }

    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}
