// Property-based tests for document identity and diff invariants.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::collections::HashSet;

use notebook_bridge_core::{CellChange, CellId, CellKind, Document, capture, diff};
use proptest::prelude::*;

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert { at: usize, code: bool },
    Delete { pick: usize },
    Move { pick: usize, to: usize },
    Edit { pick: usize, text: String },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..40usize, any::<bool>()).prop_map(|(at, code)| Op::Insert { at, code }),
        2 => (0..40usize).prop_map(|pick| Op::Delete { pick }),
        1 => (0..40usize, 0..40usize).prop_map(|(pick, to)| Op::Move { pick, to }),
        1 => (0..40usize, "[a-z]{0,6}").prop_map(|(pick, text)| Op::Edit { pick, text }),
    ]
}

/// Apply an op, occasionally with an out-of-range argument, and return
/// whether it should have succeeded.
fn apply(doc: &mut Document, op: &Op) -> bool {
    let len = doc.len();
    match op {
        Op::Insert { at, code } => {
            let kind = if *code { CellKind::Code } else { CellKind::Markdown };
            let ok = *at <= len;
            assert_eq!(doc.insert_cell(*at, kind, format!("c{at}")).is_ok(), ok);
            ok
        }
        Op::Delete { pick } => {
            let Some(id) = doc.cell_at(pick % (len + 1)).map(|c| c.id().clone()) else {
                return false;
            };
            doc.delete_cell(&id).unwrap();
            true
        }
        Op::Move { pick, to } => {
            let Some(id) = doc.cell_at(pick % (len + 1)).map(|c| c.id().clone()) else {
                return false;
            };
            let ok = *to < len;
            assert_eq!(doc.move_cell(&id, *to).is_ok(), ok);
            ok
        }
        Op::Edit { pick, text } => {
            let Some(id) = doc.cell_at(pick % (len + 1)).map(|c| c.id().clone()) else {
                return false;
            };
            doc.edit_cell_source(&id, text.clone()).unwrap();
            true
        }
    }
}

fn assert_invariants(doc: &Document) {
    doc.validate().unwrap();
    let ids: HashSet<&CellId> = doc.ids().collect();
    assert_eq!(ids.len(), doc.len());
    for (expected, cell) in doc.cells().iter().enumerate() {
        assert_eq!(doc.position_of(cell.id()), Some(expected));
    }
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn positions_stay_contiguous_and_ids_unique(ops in prop::collection::vec(arb_op(), 0..60)) {
        let mut doc = Document::new("python3");
        for op in &ops {
            let before = doc.clone();
            if !apply(&mut doc, op) {
                prop_assert_eq!(&doc, &before);
            }
            assert_invariants(&doc);
        }
    }

    #[test]
    fn diff_of_unchanged_document_is_empty(ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut doc = Document::new("python3");
        for op in &ops {
            apply(&mut doc, op);
        }
        prop_assert!(diff(&capture(&doc), &doc).is_empty());
    }

    #[test]
    fn insertions_never_report_moves(
        size in 0..12usize,
        inserts in prop::collection::vec(0..20usize, 1..6),
    ) {
        let mut doc = Document::new("python3");
        for i in 0..size {
            doc.push_cell(CellKind::Code, format!("cell {i}"));
        }
        let baseline = capture(&doc);
        let mut added = HashSet::new();
        for at in inserts {
            let at = at % (doc.len() + 1);
            added.insert(doc.insert_cell(at, CellKind::Code, "new").unwrap());
        }

        let changes = diff(&baseline, &doc);
        prop_assert_eq!(changes.len(), added.len());
        for change in changes {
            match change {
                CellChange::Added { id, position } => {
                    prop_assert!(added.contains(&id));
                    prop_assert_eq!(doc.position_of(&id), Some(position));
                }
                other => prop_assert!(false, "unexpected change {:?}", other),
            }
        }
    }

    #[test]
    fn delete_then_insert_preserves_others(size in 1..12usize, k in 0..12usize) {
        let mut doc = Document::new("python3");
        for i in 0..size {
            doc.push_cell(CellKind::Code, format!("cell {i}"));
        }
        let k = k % size;
        let original: Vec<CellId> = doc.ids().cloned().collect();

        let victim = original[k].clone();
        doc.delete_cell(&victim).unwrap();
        let replacement = doc.insert_cell(k, CellKind::Code, "replacement").unwrap();

        for (position, id) in original.iter().enumerate() {
            if *id != victim {
                prop_assert_eq!(doc.position_of(id), Some(position));
            }
        }
        prop_assert_eq!(doc.position_of(&replacement), Some(k));
    }

    #[test]
    fn serialize_load_round_trip(ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut doc = Document::new("python3");
        for op in &ops {
            apply(&mut doc, op);
        }
        let text = doc.to_json().unwrap();
        let reloaded = Document::from_json(&text).unwrap();
        prop_assert_eq!(reloaded.to_json().unwrap(), text);
        prop_assert_eq!(reloaded.len(), doc.len());
        for (a, b) in doc.cells().iter().zip(reloaded.cells()) {
            prop_assert_eq!(a.kind(), b.kind());
            prop_assert_eq!(a.source(), b.source());
            prop_assert_eq!(a.outputs(), b.outputs());
        }
    }
}
