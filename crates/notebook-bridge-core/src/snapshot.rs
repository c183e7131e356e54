//! Snapshot capture and structural diffing.
//!
//! A [`Snapshot`] is an immutable record of `(id, kind, source, position)`
//! for every cell. [`diff`] compares a baseline snapshot against the
//! current document in three passes:
//!
//! 1. id set comparison yields `Added` / `Removed`;
//! 2. source comparison on the surviving ids yields `SourceChanged`;
//! 3. relative order of the surviving, unchanged-source ids yields `Moved`.
//!
//! Moves are the complement of the longest subsequence of survivors that
//! kept their relative order, so an insertion or deletion elsewhere never
//! shows up as a move of unrelated cells.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    cell::{CellId, CellKind},
    document::Document,
};

/// One cell as seen at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
    pub position: usize,
}

/// Immutable capture of a document's structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    cells: Vec<CellSnapshot>,
    captured_at: SystemTime,
    fingerprint: String,
}

impl Snapshot {
    /// Capture the current structure of a document.
    #[must_use]
    pub fn capture(document: &Document) -> Self {
        let cells: Vec<CellSnapshot> = document
            .cells()
            .iter()
            .enumerate()
            .map(|(position, cell)| CellSnapshot {
                id: cell.id().clone(),
                kind: cell.kind(),
                source: cell.source().to_string(),
                position,
            })
            .collect();
        let fingerprint = fingerprint(&cells);
        Self {
            cells,
            captured_at: SystemTime::now(),
            fingerprint,
        }
    }

    #[must_use]
    pub fn cells(&self) -> &[CellSnapshot] {
        &self.cells
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub const fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Capture time as Unix epoch milliseconds.
    #[must_use]
    pub fn captured_at_millis(&self) -> u128 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    /// Short content hash over the id and source of every cell, in order.
    ///
    /// Kind is left out: [`diff`] has no kind-only change, so two captures
    /// with equal fingerprints always diff to nothing.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint(cells: &[CellSnapshot]) -> String {
    let mut hasher = Sha256::new();
    for cell in cells {
        hasher.update(cell.id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update((cell.source.len() as u64).to_le_bytes());
        hasher.update(cell.source.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// A single structural difference between two captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum CellChange {
    Added {
        id: CellId,
        position: usize,
    },
    Removed {
        id: CellId,
    },
    SourceChanged {
        id: CellId,
        old_source: String,
        new_source: String,
    },
    Moved {
        id: CellId,
        old_position: usize,
        new_position: usize,
    },
}

impl CellChange {
    /// The cell this change concerns.
    #[must_use]
    pub const fn cell_id(&self) -> &CellId {
        match self {
            Self::Added { id, .. }
            | Self::Removed { id }
            | Self::SourceChanged { id, .. }
            | Self::Moved { id, .. } => id,
        }
    }
}

/// Capture a document. Free-function form of [`Snapshot::capture`].
#[must_use]
pub fn capture(document: &Document) -> Snapshot {
    Snapshot::capture(document)
}

/// Diff a baseline snapshot against the current document.
#[must_use]
pub fn diff(baseline: &Snapshot, current: &Document) -> Vec<CellChange> {
    diff_snapshots(baseline, &Snapshot::capture(current))
}

/// Diff two snapshots of the same document.
#[must_use]
pub fn diff_snapshots(baseline: &Snapshot, current: &Snapshot) -> Vec<CellChange> {
    if baseline.fingerprint == current.fingerprint && baseline.cells == current.cells {
        return Vec::new();
    }

    let before: HashMap<&CellId, &CellSnapshot> =
        baseline.cells.iter().map(|c| (&c.id, c)).collect();
    let after: HashMap<&CellId, &CellSnapshot> =
        current.cells.iter().map(|c| (&c.id, c)).collect();

    let mut changes = Vec::new();

    for cell in &baseline.cells {
        if !after.contains_key(&cell.id) {
            changes.push(CellChange::Removed {
                id: cell.id.clone(),
            });
        }
    }

    for cell in &current.cells {
        if !before.contains_key(&cell.id) {
            changes.push(CellChange::Added {
                id: cell.id.clone(),
                position: cell.position,
            });
        }
    }

    // Survivors with unchanged source, in current order, with their
    // baseline position as the rank.
    let mut stable: Vec<(&CellSnapshot, usize)> = Vec::new();
    for cell in &current.cells {
        let Some(old) = before.get(&cell.id) else {
            continue;
        };
        if old.source == cell.source {
            stable.push((cell, old.position));
        } else {
            changes.push(CellChange::SourceChanged {
                id: cell.id.clone(),
                old_source: old.source.clone(),
                new_source: cell.source.clone(),
            });
        }
    }

    let ranks: Vec<usize> = stable.iter().map(|(_, rank)| *rank).collect();
    let in_order = longest_increasing(&ranks);
    for ((cell, old_position), kept) in stable.into_iter().zip(in_order) {
        if !kept {
            changes.push(CellChange::Moved {
                id: cell.id.clone(),
                old_position,
                new_position: cell.position,
            });
        }
    }

    changes
}

/// Mark the members of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for (i, &value) in seq.iter().enumerate() {
        let slot = tails.partition_point(|&t| seq[t] < value);
        if slot > 0 {
            prev[i] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }

    let mut keep = vec![false; seq.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = prev[i];
    }
    keep
}

/// One-line human summary of a change list.
#[must_use]
pub fn summarize(changes: &[CellChange]) -> String {
    if changes.is_empty() {
        return "No changes detected since last snapshot.".to_string();
    }
    let count = |pred: fn(&CellChange) -> bool| changes.iter().filter(|c| pred(c)).count();
    let added = count(|c| matches!(c, CellChange::Added { .. }));
    let removed = count(|c| matches!(c, CellChange::Removed { .. }));
    let modified = count(|c| matches!(c, CellChange::SourceChanged { .. }));
    let moved = count(|c| matches!(c, CellChange::Moved { .. }));

    [
        (added, "added"),
        (removed, "removed"),
        (modified, "modified"),
        (moved, "moved"),
    ]
    .iter()
    .filter(|(n, _)| *n > 0)
    .map(|(n, label)| format!("{n} cell(s) {label}"))
    .collect::<Vec<_>>()
    .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(sources: &[&str]) -> (Document, Vec<CellId>) {
        let mut doc = Document::new("python3");
        let ids = sources
            .iter()
            .map(|s| doc.push_cell(CellKind::Code, *s))
            .collect();
        (doc, ids)
    }

    #[test]
    fn test_kind_only_edit_keeps_fingerprint() {
        let (d, _) = doc(&["a", "b"]);
        let before = capture(&d);
        let mut after = before.clone();
        after.cells[1].kind = CellKind::Markdown;
        after.fingerprint = fingerprint(&after.cells);

        assert_eq!(before.fingerprint(), after.fingerprint());
        assert!(diff_snapshots(&before, &after).is_empty());
    }

    #[test]
    fn test_no_mutation_no_changes() {
        let (d, _) = doc(&["a", "b", "c"]);
        let snap = capture(&d);
        assert!(diff(&snap, &d).is_empty());
        assert_eq!(summarize(&[]), "No changes detected since last snapshot.");
    }

    #[test]
    fn test_insertion_is_not_a_move() {
        let (mut d, _) = doc(&["a", "b", "c"]);
        let snap = capture(&d);
        let new_id = d.insert_cell(0, CellKind::Code, "z").unwrap();

        let changes = diff(&snap, &d);
        assert_eq!(
            changes,
            vec![CellChange::Added {
                id: new_id,
                position: 0
            }]
        );
    }

    #[test]
    fn test_deletion_is_not_a_move() {
        let (mut d, ids) = doc(&["a", "b", "c"]);
        let snap = capture(&d);
        d.delete_cell(&ids[0]).unwrap();
        assert_eq!(
            diff(&snap, &d),
            vec![CellChange::Removed { id: ids[0].clone() }]
        );
    }

    #[test]
    fn test_single_move() {
        let (mut d, ids) = doc(&["a", "b", "c", "d"]);
        let snap = capture(&d);
        d.move_cell(&ids[0], 3).unwrap();

        assert_eq!(
            diff(&snap, &d),
            vec![CellChange::Moved {
                id: ids[0].clone(),
                old_position: 0,
                new_position: 3
            }]
        );
    }

    #[test]
    fn test_changed_source_is_not_also_moved() {
        let (mut d, ids) = doc(&["a", "b", "c"]);
        let snap = capture(&d);
        d.move_cell(&ids[2], 0).unwrap();
        d.edit_cell_source(&ids[2], "c2").unwrap();

        let changes = diff(&snap, &d);
        assert_eq!(
            changes,
            vec![CellChange::SourceChanged {
                id: ids[2].clone(),
                old_source: "c".into(),
                new_source: "c2".into()
            }]
        );
    }

    #[test]
    fn test_mixed_changes_and_summary() {
        let (mut d, ids) = doc(&["a", "b", "c"]);
        let snap = capture(&d);
        d.delete_cell(&ids[1]).unwrap();
        d.edit_cell_source(&ids[0], "a!").unwrap();
        d.push_cell(CellKind::Markdown, "# new");

        let changes = diff(&snap, &d);
        assert_eq!(changes.len(), 3);
        assert_eq!(
            summarize(&changes),
            "1 cell(s) added; 1 cell(s) removed; 1 cell(s) modified"
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let (mut d, ids) = doc(&["a"]);
        let first = capture(&d);
        assert_eq!(first.fingerprint().len(), 16);
        assert_eq!(first.fingerprint(), capture(&d).fingerprint());
        d.edit_cell_source(&ids[0], "b").unwrap();
        assert_ne!(first.fingerprint(), capture(&d).fingerprint());
    }

    #[test]
    fn test_longest_increasing() {
        assert_eq!(longest_increasing(&[1, 2, 0]), vec![true, true, false]);
        assert_eq!(longest_increasing(&[]), Vec::<bool>::new());
        let keep = longest_increasing(&[3, 0, 1, 2]);
        assert_eq!(keep, vec![false, true, true, true]);
    }
}
