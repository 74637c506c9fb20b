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

//! Durable queue of unresolved merges.
//!
//! A conflict is data, not an error: the merge pass records it here and
//! moves on. Nothing retries automatically; external tooling inspects the
//! queue and resolves entries one by one.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::item::Item;
use crate::kv::Batch;
use crate::kv::KvError;
use crate::kv::KvStore;
use crate::tree::keys;
use crate::version::Version;

/// Reserved tree name the queue stores its rows under.
pub const CONFLICT_TREE: &str = "_conflicts";

const NEXT_KEY_META: &str = "next";

pub type ConflictStoreResult<T> = Result<T, ConflictStoreError>;

#[derive(Debug, Error)]
pub enum ConflictStoreError {
    #[error("conflict {n} not found")]
    NotFound { n: u64 },
    #[error("corrupt conflict row: {reason}")]
    Corrupt { reason: String },
    #[error(transparent)]
    Store(#[from] KvError),
}

impl ConflictStoreError {
    fn corrupt(err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            reason: err.to_string(),
        }
    }
}

/// One unresolved merge. Field names match the stored BSON row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredConflict {
    /// The remote item that could not be lifted.
    #[serde(rename = "n")]
    pub new_item: Item,
    /// The local head it collided with, if the id was known locally.
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub local_head: Option<Item>,
    /// The partially merged item, when the merge got that far.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub merge_attempt: Option<Item>,
    /// Lowest common ancestors found, in local versions.
    #[serde(default)]
    pub lcas: Vec<Version>,
    /// Perspective the remote item arrived from.
    #[serde(rename = "pe")]
    pub perspective: String,
    /// Human-readable reason.
    #[serde(rename = "err")]
    pub error: String,
}

/// Append-only queue keyed by a monotonic integer.
#[derive(Debug)]
pub struct ConflictStore {
    store: Arc<dyn KvStore>,
}

impl ConflictStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Allocates the next key and stages the row into `batch`. The caller
    /// commits the batch; the merge pass is the only writer, so reading the
    /// counter outside the batch is safe.
    pub(crate) fn append_op(
        &self,
        conflict: &StoredConflict,
        batch: &mut Batch,
    ) -> ConflictStoreResult<u64> {
        let n = self.next_key()?;
        let encoded = bson::to_vec(conflict).map_err(ConflictStoreError::corrupt)?;
        batch.put(keys::seq_key(CONFLICT_TREE, n), encoded);
        batch.put(
            keys::meta_key(CONFLICT_TREE, NEXT_KEY_META),
            (n + 1).to_be_bytes().to_vec(),
        );
        Ok(n)
    }

    pub(crate) fn delete_op(&self, n: u64, batch: &mut Batch) {
        batch.delete(keys::seq_key(CONFLICT_TREE, n));
    }

    fn next_key(&self) -> ConflictStoreResult<u64> {
        match self.store.get(&keys::meta_key(CONFLICT_TREE, NEXT_KEY_META))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| ConflictStoreError::corrupt("truncated conflict counter"))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(1),
        }
    }

    pub fn get(&self, n: u64) -> ConflictStoreResult<Option<StoredConflict>> {
        match self.store.get(&keys::seq_key(CONFLICT_TREE, n))? {
            Some(bytes) => Ok(Some(
                bson::from_slice(&bytes).map_err(ConflictStoreError::corrupt)?,
            )),
            None => Ok(None),
        }
    }

    pub fn expect(&self, n: u64) -> ConflictStoreResult<StoredConflict> {
        self.get(n)?.ok_or(ConflictStoreError::NotFound { n })
    }

    /// Visits stored conflicts in key order. The visitor may abort with
    /// [`ControlFlow::Break`].
    pub fn for_each(
        &self,
        mut visit: impl FnMut(u64, StoredConflict) -> ControlFlow<()>,
    ) -> ConflictStoreResult<()> {
        let prefix = keys::tag_prefix(CONFLICT_TREE, keys::TAG_SEQ);
        for entry in self.store.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let n = keys::seq_of_key(&key)
                .ok_or_else(|| ConflictStoreError::corrupt("truncated conflict key"))?;
            let conflict =
                bson::from_slice(&value).map_err(ConflictStoreError::corrupt)?;
            if visit(n, conflict).is_break() {
                break;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> ConflictStoreResult<u64> {
        let prefix = keys::tag_prefix(CONFLICT_TREE, keys::TAG_SEQ);
        let mut count = 0;
        for entry in self.store.scan_prefix(&prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> ConflictStoreResult<bool> {
        Ok(self.len()? == 0)
    }
}
