//! Row-level patches between query result snapshots.
//!
//! Reactive consumers receive the smallest edit that turns their previous
//! snapshot into the next one: either a handful of single-row replacements
//! or, when everything moved, one whole-snapshot replacement.

use serde::{Deserialize, Serialize};

use crate::value::Row;

/// A minimal edit from one snapshot to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Patch {
    /// Replace the whole snapshot.
    ReplaceAll { rows: Vec<Row> },
    /// Replace a single row in place.
    ReplaceAt { index: usize, row: Row },
}

/// Compute patches turning `prev` into `next`.
///
/// No previous snapshot or a changed row count forces `ReplaceAll`;
/// otherwise rows are compared pairwise and each differing row becomes a
/// `ReplaceAt`. If every row differs the result compacts to `ReplaceAll`.
pub fn make_patches(prev: Option<&[Row]>, next: &[Row]) -> Vec<Patch> {
    let Some(prev) = prev else {
        return vec![Patch::ReplaceAll {
            rows: next.to_vec(),
        }];
    };

    if prev.len() != next.len() {
        return vec![Patch::ReplaceAll {
            rows: next.to_vec(),
        }];
    }

    let replacements: Vec<Patch> = prev
        .iter()
        .zip(next.iter())
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(index, (_, b))| Patch::ReplaceAt {
            index,
            row: b.clone(),
        })
        .collect();

    if !next.is_empty() && replacements.len() == next.len() {
        return vec![Patch::ReplaceAll {
            rows: next.to_vec(),
        }];
    }

    replacements
}

/// Apply patches to a snapshot. The inverse of [`make_patches`].
pub fn apply_patches(patches: &[Patch], current: &[Row]) -> Vec<Row> {
    let mut rows = current.to_vec();
    for patch in patches {
        match patch {
            Patch::ReplaceAll { rows: next } => rows = next.clone(),
            Patch::ReplaceAt { index, row } => {
                if let Some(slot) = rows.get_mut(*index) {
                    *slot = row.clone();
                }
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(title: &str) -> Row {
        Row::from_pairs(vec![("title".into(), Value::from(title))])
    }

    #[test]
    fn no_previous_snapshot_replaces_all() {
        let next = vec![row("a"), row("b")];
        let patches = make_patches(None, &next);
        assert_eq!(patches, vec![Patch::ReplaceAll { rows: next.clone() }]);
        assert_eq!(apply_patches(&patches, &[]), next);
    }

    #[test]
    fn equal_snapshots_produce_no_patches() {
        let rows = vec![row("a"), row("b")];
        assert!(make_patches(Some(&rows), &rows).is_empty());
    }

    #[test]
    fn single_changed_row_is_replaced_in_place() {
        let prev = vec![row("a"), row("b"), row("c")];
        let next = vec![row("a"), row("B"), row("c")];

        let patches = make_patches(Some(&prev), &next);
        assert_eq!(
            patches,
            vec![Patch::ReplaceAt {
                index: 1,
                row: row("B"),
            }]
        );
        assert_eq!(apply_patches(&patches, &prev), next);
    }

    #[test]
    fn changed_row_count_replaces_all() {
        let prev = vec![row("a")];
        let next = vec![row("a"), row("b")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(patches, vec![Patch::ReplaceAll { rows: next.clone() }]);
        assert_eq!(apply_patches(&patches, &prev), next);
    }

    #[test]
    fn all_rows_changed_compacts_to_replace_all() {
        let prev = vec![row("a"), row("b")];
        let next = vec![row("x"), row("y")];
        let patches = make_patches(Some(&prev), &next);
        assert_eq!(patches, vec![Patch::ReplaceAll { rows: next.clone() }]);
    }

    #[test]
    fn apply_is_inverse_of_make() {
        let cases: Vec<(Vec<Row>, Vec<Row>)> = vec![
            (vec![], vec![]),
            (vec![], vec![row("a")]),
            (vec![row("a")], vec![]),
            (vec![row("a"), row("b")], vec![row("a"), row("c")]),
            (vec![row("a"), row("b")], vec![row("c"), row("d")]),
        ];
        for (prev, next) in cases {
            let patches = make_patches(Some(&prev), &next);
            assert_eq!(apply_patches(&patches, &prev), next);
        }
    }
}
