//! Notebook document model.
//!
//! A [`Document`] is an ordered sequence of cells. Positions are never
//! stored: a cell's position is its index in the sequence, so positions
//! are always the contiguous range `0..n` and inserting or deleting at one
//! index never touches the identity of any other cell.
//!
//! Every mutation validates its arguments before touching the sequence,
//! so a rejected mutation leaves the document exactly as it was.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    cell::{Cell, CellId, CellKind},
    error::DocumentError,
    output::{Output, multiline},
};

const NBFORMAT: u32 = 4;
const NBFORMAT_MINOR: u32 = 5;

/// Reference to a cell either by stable id or by current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellRef {
    Id(CellId),
    Position(usize),
}

impl From<CellId> for CellRef {
    fn from(id: CellId) -> Self {
        Self::Id(id)
    }
}

impl From<&CellId> for CellRef {
    fn from(id: &CellId) -> Self {
        Self::Id(id.clone())
    }
}

impl From<usize> for CellRef {
    fn from(position: usize) -> Self {
        Self::Position(position)
    }
}

/// Ordered collection of cells plus notebook-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    cells: Vec<Cell>,
    metadata: Map<String, Value>,
    nbformat: u32,
    nbformat_minor: u32,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            metadata: Map::new(),
            nbformat: NBFORMAT,
            nbformat_minor: NBFORMAT_MINOR,
        }
    }
}

impl Document {
    /// Create an empty document bound to a kernel spec.
    #[must_use]
    pub fn new(kernel_name: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert(
            "kernelspec".into(),
            json!({
                "display_name": kernel_name,
                "language": "python",
                "name": kernel_name,
            }),
        );
        metadata.insert("language_info".into(), json!({ "name": "python" }));
        Self {
            metadata,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells in document order.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    #[must_use]
    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == *id)
    }

    #[must_use]
    pub fn cell_at(&self, position: usize) -> Option<&Cell> {
        self.cells.get(position)
    }

    /// Current position of a cell.
    #[must_use]
    pub fn position_of(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| c.id == *id)
    }

    /// Stable ids in document order.
    pub fn ids(&self) -> impl Iterator<Item = &CellId> {
        self.cells.iter().map(|c| &c.id)
    }

    /// Kernel spec name from the notebook metadata.
    #[must_use]
    pub fn kernel_name(&self) -> Option<&str> {
        self.metadata
            .get("kernelspec")
            .and_then(|spec| spec.get("name"))
            .and_then(Value::as_str)
    }

    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Resolve a reference to the stable id of an existing cell.
    ///
    /// # Errors
    /// `NoSuchCell` for an unknown id, `IndexOutOfRange` for a bad position.
    pub fn resolve(&self, target: &CellRef) -> Result<CellId, DocumentError> {
        match target {
            CellRef::Id(id) => self
                .cell(id)
                .map(|c| c.id.clone())
                .ok_or_else(|| DocumentError::NoSuchCell(id.clone())),
            CellRef::Position(index) => self
                .cells
                .get(*index)
                .map(|c| c.id.clone())
                .ok_or(DocumentError::IndexOutOfRange {
                    index: *index,
                    len: self.cells.len(),
                }),
        }
    }

    /// Insert a new cell at `position`, shifting later cells right.
    ///
    /// # Errors
    /// `IndexOutOfRange` if `position > len`.
    pub fn insert_cell(
        &mut self,
        position: usize,
        kind: CellKind,
        source: impl Into<String>,
    ) -> Result<CellId, DocumentError> {
        if position > self.cells.len() {
            return Err(DocumentError::IndexOutOfRange {
                index: position,
                len: self.cells.len(),
            });
        }
        let id = CellId::generate();
        if self.cell(&id).is_some() {
            return Err(DocumentError::DuplicateCellId(id));
        }
        self.cells.insert(position, Cell::new(id.clone(), kind, source.into()));
        Ok(id)
    }

    /// Append a cell at the end.
    pub fn push_cell(&mut self, kind: CellKind, source: impl Into<String>) -> CellId {
        let id = CellId::generate();
        self.cells.push(Cell::new(id.clone(), kind, source.into()));
        id
    }

    /// Replace a cell's source.
    ///
    /// Returns whether the source changed. A code cell whose source
    /// changed loses its outputs and execution count; an unchanged source
    /// is a no-op.
    ///
    /// # Errors
    /// `NoSuchCell` if the id is unknown.
    pub fn edit_cell_source(
        &mut self,
        id: &CellId,
        source: impl Into<String>,
    ) -> Result<bool, DocumentError> {
        let cell = self.cell_mut(id)?;
        let source = source.into();
        if cell.source == source {
            return Ok(false);
        }
        cell.source = source;
        if cell.kind.is_code() {
            cell.outputs.clear();
            cell.execution_count = None;
        }
        Ok(true)
    }

    /// Remove a cell and return it. Later cells close the gap.
    ///
    /// # Errors
    /// `NoSuchCell` if the id is unknown.
    pub fn delete_cell(&mut self, id: &CellId) -> Result<Cell, DocumentError> {
        let position = self
            .position_of(id)
            .ok_or_else(|| DocumentError::NoSuchCell(id.clone()))?;
        Ok(self.cells.remove(position))
    }

    /// Move a cell to `new_position` without changing its identity.
    ///
    /// # Errors
    /// `NoSuchCell` if the id is unknown, `IndexOutOfRange` if
    /// `new_position >= len`.
    pub fn move_cell(&mut self, id: &CellId, new_position: usize) -> Result<(), DocumentError> {
        let from = self
            .position_of(id)
            .ok_or_else(|| DocumentError::NoSuchCell(id.clone()))?;
        if new_position >= self.cells.len() {
            return Err(DocumentError::IndexOutOfRange {
                index: new_position,
                len: self.cells.len(),
            });
        }
        if from != new_position {
            let cell = self.cells.remove(from);
            self.cells.insert(new_position, cell);
        }
        Ok(())
    }

    /// Store the outcome of an execution on a code cell, replacing any
    /// previous outputs wholesale.
    ///
    /// # Errors
    /// `NoSuchCell` if the id is unknown, `NotCodeCell` for narrative cells.
    pub fn record_execution(
        &mut self,
        id: &CellId,
        outputs: Vec<Output>,
        execution_count: Option<u32>,
    ) -> Result<(), DocumentError> {
        let cell = self.cell_mut(id)?;
        if !cell.kind.is_code() {
            return Err(DocumentError::NotCodeCell(id.clone()));
        }
        cell.outputs = outputs;
        if execution_count.is_some() {
            cell.execution_count = execution_count;
        }
        Ok(())
    }

    /// Check the identity invariant: every stable id is unique.
    ///
    /// # Errors
    /// `DuplicateCellId` naming the first repeated id.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let mut seen = HashSet::with_capacity(self.cells.len());
        for cell in &self.cells {
            if !seen.insert(&cell.id) {
                return Err(DocumentError::DuplicateCellId(cell.id.clone()));
            }
        }
        Ok(())
    }

    fn cell_mut(&mut self, id: &CellId) -> Result<&mut Cell, DocumentError> {
        self.cells
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| DocumentError::NoSuchCell(id.clone()))
    }

    /// Snapshot of the current state in persistence form.
    #[must_use]
    pub fn serialize(&self) -> NotebookFile {
        NotebookFile {
            cells: self.cells.iter().map(CellRecord::from_cell).collect(),
            metadata: self.metadata.clone(),
            nbformat: self.nbformat,
            nbformat_minor: self.nbformat_minor,
        }
    }

    /// Build a document from its persistence form.
    ///
    /// Well-formed, unique ids from the file are kept; anything else gets
    /// a fresh id.
    #[must_use]
    pub fn load(file: NotebookFile) -> Self {
        let mut seen = HashSet::with_capacity(file.cells.len());
        let cells = file
            .cells
            .into_iter()
            .map(|record| {
                let mut cell = record.into_cell();
                if !seen.insert(cell.id.clone()) {
                    tracing::debug!(cell = %cell.id, "Duplicate cell id on load, reassigning");
                    cell.id = CellId::generate();
                    seen.insert(cell.id.clone());
                }
                cell
            })
            .collect();
        Self {
            cells,
            metadata: file.metadata,
            nbformat: file.nbformat,
            nbformat_minor: file.nbformat_minor,
        }
    }

    /// Serialize to `.ipynb` JSON text.
    ///
    /// # Errors
    /// Returns `Format` if serialization fails.
    pub fn to_json(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(&self.serialize())
            .map_err(|e| DocumentError::Format(e.to_string()))
    }

    /// Parse `.ipynb` JSON text.
    ///
    /// # Errors
    /// Returns `Format` if the text is not a v4 notebook.
    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        let file: NotebookFile =
            serde_json::from_str(text).map_err(|e| DocumentError::Format(e.to_string()))?;
        if file.nbformat != NBFORMAT {
            return Err(DocumentError::Format(format!(
                "unsupported nbformat {}",
                file.nbformat
            )));
        }
        Ok(Self::load(file))
    }
}

const fn default_nbformat() -> u32 {
    NBFORMAT
}

const fn default_nbformat_minor() -> u32 {
    NBFORMAT_MINOR
}

/// Persistence form of a notebook (nbformat v4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookFile {
    pub cells: Vec<CellRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    #[serde(default = "default_nbformat_minor")]
    pub nbformat_minor: u32,
}

/// Persistence form of a single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum CellRecord {
    Code {
        #[serde(default)]
        execution_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        outputs: Vec<Output>,
        #[serde(default, deserialize_with = "multiline")]
        source: String,
    },
    Markdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, deserialize_with = "multiline")]
        source: String,
    },
    Raw {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, deserialize_with = "multiline")]
        source: String,
    },
}

impl CellRecord {
    fn from_cell(cell: &Cell) -> Self {
        let id = Some(cell.id.to_string());
        let metadata = cell.metadata.clone();
        let source = cell.source.clone();
        match cell.kind {
            CellKind::Code => Self::Code {
                execution_count: cell.execution_count,
                id,
                metadata,
                outputs: cell.outputs.clone(),
                source,
            },
            CellKind::Markdown => Self::Markdown {
                id,
                metadata,
                source,
            },
            CellKind::Raw => Self::Raw {
                id,
                metadata,
                source,
            },
        }
    }

    fn into_cell(self) -> Cell {
        let (kind, id, metadata, source, outputs, execution_count) = match self {
            Self::Code {
                execution_count,
                id,
                metadata,
                outputs,
                source,
            } => (CellKind::Code, id, metadata, source, outputs, execution_count),
            Self::Markdown {
                id,
                metadata,
                source,
            } => (CellKind::Markdown, id, metadata, source, Vec::new(), None),
            Self::Raw {
                id,
                metadata,
                source,
            } => (CellKind::Raw, id, metadata, source, Vec::new(), None),
        };
        let id = id
            .as_deref()
            .and_then(CellId::parse)
            .unwrap_or_else(CellId::generate);
        Cell {
            id,
            kind,
            source,
            outputs,
            execution_count,
            metadata,
        }
    }

    /// Source text of the record.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Code { source, .. } | Self::Markdown { source, .. } | Self::Raw { source, .. } => {
                source
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StreamName;

    fn doc_with(sources: &[&str]) -> (Document, Vec<CellId>) {
        let mut doc = Document::new("python3");
        let ids = sources
            .iter()
            .map(|s| doc.push_cell(CellKind::Code, *s))
            .collect();
        (doc, ids)
    }

    #[test]
    fn test_insert_shifts_positions_not_ids() {
        let (mut doc, ids) = doc_with(&["a", "b"]);
        let new_id = doc.insert_cell(1, CellKind::Markdown, "# note").unwrap();

        assert_eq!(doc.position_of(&ids[0]), Some(0));
        assert_eq!(doc.position_of(&new_id), Some(1));
        assert_eq!(doc.position_of(&ids[1]), Some(2));
        assert_eq!(doc.cell(&ids[1]).unwrap().source(), "b");
    }

    #[test]
    fn test_insert_out_of_range_leaves_document_untouched() {
        let (mut doc, _) = doc_with(&["a"]);
        let before = doc.clone();
        let err = doc.insert_cell(2, CellKind::Code, "x").unwrap_err();
        assert_eq!(err, DocumentError::IndexOutOfRange { index: 2, len: 1 });
        assert_eq!(doc, before);
    }

    #[test]
    fn test_insert_at_end_is_allowed() {
        let (mut doc, _) = doc_with(&["a"]);
        let id = doc.insert_cell(1, CellKind::Code, "b").unwrap();
        assert_eq!(doc.position_of(&id), Some(1));
    }

    #[test]
    fn test_edit_clears_outputs_only_when_source_changes() {
        let (mut doc, ids) = doc_with(&["print(1)"]);
        doc.record_execution(&ids[0], vec![Output::stream(StreamName::Stdout, "1\n")], Some(1))
            .unwrap();

        assert!(!doc.edit_cell_source(&ids[0], "print(1)").unwrap());
        assert_eq!(doc.cell(&ids[0]).unwrap().outputs().len(), 1);
        assert_eq!(doc.cell(&ids[0]).unwrap().execution_count(), Some(1));

        assert!(doc.edit_cell_source(&ids[0], "print(2)").unwrap());
        assert!(doc.cell(&ids[0]).unwrap().outputs().is_empty());
        assert_eq!(doc.cell(&ids[0]).unwrap().execution_count(), None);
    }

    #[test]
    fn test_edit_unknown_cell() {
        let (mut doc, _) = doc_with(&[]);
        let ghost = CellId::generate();
        assert_eq!(
            doc.edit_cell_source(&ghost, "x"),
            Err(DocumentError::NoSuchCell(ghost))
        );
    }

    #[test]
    fn test_delete_returns_cell_and_closes_gap() {
        let (mut doc, ids) = doc_with(&["a", "b", "c"]);
        let removed = doc.delete_cell(&ids[1]).unwrap();
        assert_eq!(removed.source(), "b");
        assert_eq!(doc.position_of(&ids[2]), Some(1));
        assert!(doc.delete_cell(&ids[1]).is_err());
    }

    #[test]
    fn test_delete_then_insert_restores_order() {
        let (mut doc, ids) = doc_with(&["a", "b", "c", "d"]);
        doc.delete_cell(&ids[2]).unwrap();
        let replacement = doc.insert_cell(2, CellKind::Code, "c2").unwrap();
        let order: Vec<&CellId> = doc.ids().collect();
        assert_eq!(order, vec![&ids[0], &ids[1], &replacement, &ids[3]]);
    }

    #[test]
    fn test_move_cell() {
        let (mut doc, ids) = doc_with(&["a", "b", "c"]);
        doc.move_cell(&ids[0], 2).unwrap();
        let order: Vec<&CellId> = doc.ids().collect();
        assert_eq!(order, vec![&ids[1], &ids[2], &ids[0]]);

        let before = doc.clone();
        assert!(doc.move_cell(&ids[0], 3).is_err());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_record_execution_rejects_narrative_cells() {
        let mut doc = Document::new("python3");
        let md = doc.push_cell(CellKind::Markdown, "# title");
        assert_eq!(
            doc.record_execution(&md, Vec::new(), Some(1)),
            Err(DocumentError::NotCodeCell(md))
        );
    }

    #[test]
    fn test_resolve() {
        let (doc, ids) = doc_with(&["a", "b"]);
        assert_eq!(doc.resolve(&CellRef::Position(1)).unwrap(), ids[1]);
        assert_eq!(doc.resolve(&CellRef::from(&ids[0])).unwrap(), ids[0]);
        assert_eq!(
            doc.resolve(&CellRef::Position(5)),
            Err(DocumentError::IndexOutOfRange { index: 5, len: 2 })
        );
    }

    #[test]
    fn test_serialize_load_serialize_is_identical() {
        let (mut doc, ids) = doc_with(&["x = 1", "raise ValueError('boom')"]);
        doc.insert_cell(0, CellKind::Markdown, "# Title").unwrap();
        doc.record_execution(
            &ids[1],
            vec![Output::error("ValueError", "boom", vec!["tb".into()])],
            Some(2),
        )
        .unwrap();

        let first = doc.to_json().unwrap();
        let reloaded = Document::from_json(&first).unwrap();
        let second = reloaded.to_json().unwrap();
        assert_eq!(first, second);

        for (a, b) in doc.cells().iter().zip(reloaded.cells()) {
            assert_eq!(a.kind(), b.kind());
            assert_eq!(a.source(), b.source());
            assert_eq!(a.outputs(), b.outputs());
            assert_eq!(a.execution_count(), b.execution_count());
        }
    }

    #[test]
    fn test_load_foreign_notebook() {
        let text = r##"{
            "cells": [
                {"cell_type": "markdown", "metadata": {}, "source": ["# Intro\n", "text"]},
                {"cell_type": "code", "id": "dup", "metadata": {}, "execution_count": null,
                 "outputs": [], "source": "a = 1"},
                {"cell_type": "code", "id": "dup", "metadata": {}, "execution_count": 4,
                 "outputs": [{"output_type": "stream", "name": "stdout", "text": "hi\n"}],
                 "source": "print('hi')"},
                {"cell_type": "raw", "metadata": {}, "source": "raw text"}
            ],
            "metadata": {"kernelspec": {"name": "python3", "display_name": "Python 3"}},
            "nbformat": 4,
            "nbformat_minor": 4
        }"##;
        let doc = Document::from_json(text).unwrap();
        assert_eq!(doc.len(), 4);
        assert_eq!(doc.cell_at(0).unwrap().source(), "# Intro\ntext");
        assert_eq!(doc.cell_at(1).unwrap().id().as_str(), "dup");
        assert_ne!(doc.cell_at(2).unwrap().id().as_str(), "dup");
        assert_eq!(doc.cell_at(2).unwrap().execution_count(), Some(4));
        assert_eq!(doc.cell_at(3).unwrap().kind(), CellKind::Raw);
        assert_eq!(doc.kernel_name(), Some("python3"));
        doc.validate().unwrap();
    }

    #[test]
    fn test_rejects_other_nbformat_versions() {
        let text = r#"{"cells": [], "metadata": {}, "nbformat": 3, "nbformat_minor": 0}"#;
        assert!(matches!(
            Document::from_json(text),
            Err(DocumentError::Format(_))
        ));
    }
}
