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

//! Ordered byte-key/byte-value store abstraction.
//!
//! Everything the trees need from the underlying store: point reads, ordered
//! scans, and atomic multi-key batches. [`crate::fjall_store::FjallStore`] is
//! the persistent implementation; `memory_store::MemoryStore` (behind the
//! `testing` feature) backs tests.

use std::fmt::Debug;

use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

/// Store-level failure. I/O errors are fatal to the owning engine.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("store I/O error")]
    Io {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("store is closed")]
    Closed,
}

impl KvError {
    pub fn io(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Io {
            source: source.into(),
        }
    }
}

/// One key/value pair yielded by a scan.
pub type KvEntry = (Vec<u8>, Vec<u8>);

/// Ordered scan over entries. Entries come in ascending key order.
pub type KvIter<'a> = Box<dyn Iterator<Item = KvResult<KvEntry>> + Send + 'a>;

#[derive(Debug)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A set of writes applied atomically. Either every operation is visible
/// after [`KvStore::write`] returns, or none is.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drains the batch into (key, value-or-delete) operations.
    pub(crate) fn into_ops(self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> {
        self.ops.into_iter().map(|op| match op {
            BatchOp::Put { key, value } => (key, Some(value)),
            BatchOp::Delete { key } => (key, None),
        })
    }
}

/// An ordered byte-keyed store with prefix scans and atomic batches.
pub trait KvStore: Send + Sync + Debug {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    fn contains(&self, key: &[u8]) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies the batch atomically.
    fn write(&self, batch: Batch) -> KvResult<()>;

    /// All entries whose key starts with `prefix`, ascending.
    fn scan_prefix(&self, prefix: &[u8]) -> KvIter<'_>;

    /// All entries with key >= `start`, ascending, to the end of the store.
    /// Callers bound the walk themselves.
    fn scan_from(&self, start: &[u8]) -> KvIter<'_>;

    /// The entry with the largest key under `prefix`.
    fn last_in_prefix(&self, prefix: &[u8]) -> KvResult<Option<KvEntry>>;

    /// Flushes buffered writes to durable storage.
    fn persist(&self) -> KvResult<()>;
}
