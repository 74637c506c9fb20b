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

//! The canonical versioned record carried everywhere: on the wire, in
//! per-perspective trees and in the local tree.

use bson::Document;
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::version::ItemId;
use crate::version::Version;

/// Ids longer than this are rejected; the length has to fit the one-byte
/// length prefix of the index keys.
pub const MAX_ID_SIZE: usize = 254;

/// Upper bound on `pa` entries. An item is either a root, a child, or a
/// two-parent merge.
pub const MAX_PARENTS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedItemError {
    #[error("item id is empty")]
    EmptyId,
    #[error("item id is {len} bytes, max is {MAX_ID_SIZE}")]
    IdTooLong { len: usize },
    #[error("version is {actual} bytes, tree uses {expected}")]
    WrongVersionSize { expected: usize, actual: usize },
    #[error("item has {count} parents, max is {MAX_PARENTS}")]
    TooManyParents { count: usize },
    #[error("parent {v} listed twice")]
    DuplicateParent { v: Version },
    #[error("tombstone carries a body")]
    TombstoneWithBody,
    #[error("item names perspective {actual:?}, stream is {expected:?}")]
    PerspectiveMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },
}

/// Header of an [`Item`]. Field names match the wire representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Logical identifier shared by all versions of one document.
    pub id: ItemId,
    /// Version of this item, random and unique within its tree.
    pub v: Version,
    /// Parent versions, oldest first. Empty for roots.
    #[serde(default)]
    pub pa: SmallVec<[Version; 2]>,
    /// Perspective name; present inside remote trees, absent in local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pe: Option<String>,
    /// Insertion sequence, assigned by the tree on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<u64>,
    /// Tombstone marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub d: bool,
    /// Conflict marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub c: bool,
}

/// One versioned document record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "h")]
    pub header: Header,
    /// Opaque document body; absent for tombstones.
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Document>,
    /// Adapter-private annotations, e.g. a source oplog timestamp.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Document>,
}

impl Item {
    /// A new item with the given header fields and body. `i` is left for the
    /// tree to assign.
    pub fn new(
        id: ItemId,
        v: Version,
        pa: impl IntoIterator<Item = Version>,
        body: Option<Document>,
    ) -> Self {
        Self {
            header: Header {
                id,
                v,
                pa: pa.into_iter().collect(),
                pe: None,
                i: None,
                d: false,
                c: false,
            },
            body,
            meta: None,
        }
    }

    /// A tombstone for the given id, chained onto `pa`.
    pub fn new_tombstone(id: ItemId, v: Version, pa: impl IntoIterator<Item = Version>) -> Self {
        let mut item = Self::new(id, v, pa, None);
        item.header.d = true;
        item
    }

    pub fn is_tombstone(&self) -> bool {
        self.header.d
    }

    pub fn is_conflict_marker(&self) -> bool {
        self.header.c
    }

    pub fn is_root(&self) -> bool {
        self.header.pa.is_empty()
    }

    /// Checks the shape invariants that do not need tree state. The tree
    /// checks duplicate versions and parent existence on write.
    pub fn validate(&self, version_size: usize) -> Result<(), MalformedItemError> {
        let header = &self.header;
        if header.id.is_empty() {
            return Err(MalformedItemError::EmptyId);
        }
        if header.id.len() > MAX_ID_SIZE {
            return Err(MalformedItemError::IdTooLong {
                len: header.id.len(),
            });
        }
        if header.v.len() != version_size {
            return Err(MalformedItemError::WrongVersionSize {
                expected: version_size,
                actual: header.v.len(),
            });
        }
        if header.pa.len() > MAX_PARENTS {
            return Err(MalformedItemError::TooManyParents {
                count: header.pa.len(),
            });
        }
        if header.pa.len() == 2 && header.pa[0] == header.pa[1] {
            return Err(MalformedItemError::DuplicateParent {
                v: header.pa[0].clone(),
            });
        }
        for pa in &header.pa {
            if pa.len() != version_size {
                return Err(MalformedItemError::WrongVersionSize {
                    expected: version_size,
                    actual: pa.len(),
                });
            }
        }
        if header.d && self.body.is_some() {
            return Err(MalformedItemError::TombstoneWithBody);
        }
        Ok(())
    }
}
