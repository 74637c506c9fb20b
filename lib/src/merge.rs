// Copyright 2026 The PerspectiveDB Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Three-way merge of document bodies.
//!
//! The merge is shallow: each top-level field is resolved independently
//! against its state in the lowest common ancestor, and nested documents are
//! compared as opaque values. Conflicts are values, not errors; the caller
//! decides what to do with them.

use std::collections::BTreeSet;

use bson::Bson;
use bson::Document;

/// One side of a merge: the body as it stands at a head, with its tombstone
/// flag.
#[derive(Clone, Copy, Debug)]
pub struct MergeSide<'a> {
    pub body: Option<&'a Document>,
    pub deleted: bool,
}

impl<'a> MergeSide<'a> {
    pub fn alive(body: Option<&'a Document>) -> Self {
        Self {
            body,
            deleted: false,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            body: None,
            deleted: true,
        }
    }
}

/// Result of merging two sides over their common ancestor.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    /// Both sides agree (possibly after taking single-sided changes).
    Resolved {
        body: Option<Document>,
        deleted: bool,
    },
    /// At least one field was changed incompatibly on both sides.
    Conflict(ConflictReason),
}

/// Why a merge could not be resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    /// Both sides changed the named fields to different values.
    Fields(Vec<String>),
    /// One side deleted the document while the other changed it.
    DeleteVersusModify,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fields(fields) => write!(f, "merge conflict on {}", fields.join(", ")),
            Self::DeleteVersusModify => write!(f, "delete versus modify"),
        }
    }
}

/// Merges `left` and `right` relative to their lowest common ancestor.
///
/// The result is symmetric in `left`/`right`: swapping the sides yields the
/// same resolved body (fields are emitted in sorted order) or the same
/// conflict.
pub fn merge_bodies(
    lca: Option<&Document>,
    left: MergeSide<'_>,
    right: MergeSide<'_>,
) -> MergeOutcome {
    match (left.deleted, right.deleted) {
        (true, true) => {
            return MergeOutcome::Resolved {
                body: None,
                deleted: true,
            };
        }
        (true, false) => return merge_against_tombstone(lca, right),
        (false, true) => return merge_against_tombstone(lca, left),
        (false, false) => {}
    }

    let empty = Document::new();
    let base = lca.unwrap_or(&empty);
    let left_body = left.body.unwrap_or(&empty);
    let right_body = right.body.unwrap_or(&empty);

    let mut fields = BTreeSet::new();
    for key in base.keys().chain(left_body.keys()).chain(right_body.keys()) {
        fields.insert(key.clone());
    }

    let mut merged = Document::new();
    let mut conflicts = vec![];
    for field in fields {
        let base_value = base.get(&field);
        let left_value = left_body.get(&field);
        let right_value = right_body.get(&field);
        match merge_field(base_value, left_value, right_value) {
            Ok(Some(value)) => {
                merged.insert(field, value);
            }
            Ok(None) => {}
            Err(()) => conflicts.push(field),
        }
    }

    if conflicts.is_empty() {
        MergeOutcome::Resolved {
            body: Some(merged),
            deleted: false,
        }
    } else {
        MergeOutcome::Conflict(ConflictReason::Fields(conflicts))
    }
}

/// One side is a tombstone. Deleting wins only against an unchanged other
/// side.
fn merge_against_tombstone(lca: Option<&Document>, alive: MergeSide<'_>) -> MergeOutcome {
    let unchanged = match (lca, alive.body) {
        (Some(base), Some(body)) => base == body,
        (None, None) => true,
        _ => false,
    };
    if unchanged {
        MergeOutcome::Resolved {
            body: None,
            deleted: true,
        }
    } else {
        MergeOutcome::Conflict(ConflictReason::DeleteVersusModify)
    }
}

/// Per-field three-way rule. `Ok(None)` means the field is absent from the
/// merged body; `Err(())` is a conflict.
fn merge_field(
    base: Option<&Bson>,
    left: Option<&Bson>,
    right: Option<&Bson>,
) -> Result<Option<Bson>, ()> {
    if left == right {
        return Ok(left.cloned());
    }
    if left == base {
        return Ok(right.cloned());
    }
    if right == base {
        return Ok(left.cloned());
    }
    Err(())
}
