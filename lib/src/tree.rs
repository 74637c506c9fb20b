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

//! One append-only versioned log, the per-perspective unit of storage.
//!
//! A tree maintains four indices over its items: by version (primary), by id
//! (versions of one document in insertion order), by insertion sequence `i`,
//! and the current head set per id. All rows for one item are written in a
//! single atomic batch, so a tree is never observed half-updated.

use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::item::Item;
use crate::item::MalformedItemError;
use crate::kv::Batch;
use crate::kv::KvError;
use crate::kv::KvStore;
use crate::version::ItemId;
use crate::version::Version;

pub type TreeResult<T> = Result<T, TreeError>;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("malformed item")]
    Malformed(#[from] MalformedItemError),
    #[error("version {v} already exists")]
    DuplicateVersion { v: Version },
    #[error("parent {v} does not exist")]
    MissingParent { v: Version },
    #[error("version {v} not found")]
    VersionNotFound { v: Version },
    #[error("write for {id} not flushed within the retry budget")]
    FlushTimeout { id: ItemId },
    #[error("corrupt tree row: {reason}")]
    Corrupt { reason: String },
    #[error(transparent)]
    Store(#[from] KvError),
}

impl TreeError {
    fn corrupt(err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            reason: err.to_string(),
        }
    }
}

/// Index key layout. Every key starts with the length-prefixed tree name
/// followed by a tag byte selecting the index:
///
/// | tag | payload               | value           |
/// |-----|-----------------------|-----------------|
/// | 1   | `v`                   | serialized item |
/// | 2   | `len(id) id i:be64`   | `v`             |
/// | 3   | `i:be64`              | `v`             |
/// | 4   | `len(id) id v`        | empty           |
/// | 5   | name bytes            | value           |
pub(crate) mod keys {
    use super::ItemId;
    use super::Version;

    pub const TAG_VERSION: u8 = 1;
    pub const TAG_ID: u8 = 2;
    pub const TAG_SEQ: u8 = 3;
    pub const TAG_HEAD: u8 = 4;
    pub const TAG_META: u8 = 5;

    pub fn tree_prefix(tree: &str) -> Vec<u8> {
        let name = tree.as_bytes();
        let mut key = Vec::with_capacity(name.len() + 1);
        key.push(name.len() as u8);
        key.extend_from_slice(name);
        key
    }

    pub fn tag_prefix(tree: &str, tag: u8) -> Vec<u8> {
        let mut key = tree_prefix(tree);
        key.push(tag);
        key
    }

    pub fn version_key(tree: &str, v: &Version) -> Vec<u8> {
        let mut key = tag_prefix(tree, TAG_VERSION);
        key.extend_from_slice(v.as_bytes());
        key
    }

    pub fn id_prefix(tree: &str, id: &ItemId) -> Vec<u8> {
        let mut key = tag_prefix(tree, TAG_ID);
        key.push(id.len() as u8);
        key.extend_from_slice(id.as_bytes());
        key
    }

    pub fn id_key(tree: &str, id: &ItemId, seq: u64) -> Vec<u8> {
        let mut key = id_prefix(tree, id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn seq_key(tree: &str, seq: u64) -> Vec<u8> {
        let mut key = tag_prefix(tree, TAG_SEQ);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn seq_of_key(key: &[u8]) -> Option<u64> {
        let tail = key.get(key.len().checked_sub(8)?..)?;
        Some(u64::from_be_bytes(tail.try_into().ok()?))
    }

    pub fn heads_prefix(tree: &str, id: &ItemId) -> Vec<u8> {
        let mut key = tag_prefix(tree, TAG_HEAD);
        key.push(id.len() as u8);
        key.extend_from_slice(id.as_bytes());
        key
    }

    pub fn head_key(tree: &str, id: &ItemId, v: &Version) -> Vec<u8> {
        let mut key = heads_prefix(tree, id);
        key.extend_from_slice(v.as_bytes());
        key
    }

    /// Splits a head key back into (id, v).
    pub fn split_head_key(tree: &str, key: &[u8]) -> Option<(ItemId, Version)> {
        let rest = key.get(tag_prefix(tree, TAG_HEAD).len()..)?;
        let (&id_len, rest) = rest.split_first()?;
        let id = rest.get(..id_len as usize)?;
        let v = rest.get(id_len as usize..)?;
        Some((ItemId::from_bytes(id), Version::from_bytes(v)))
    }

    pub fn meta_key(tree: &str, name: &str) -> Vec<u8> {
        let mut key = tag_prefix(tree, TAG_META);
        key.extend_from_slice(name.as_bytes());
        key
    }
}

/// Head-set query. `id` and `prefix` are mutually exclusive; with neither,
/// every head in the tree is visited.
#[derive(Clone, Debug, Default)]
pub struct HeadsSelector {
    pub id: Option<ItemId>,
    pub prefix: Option<Vec<u8>>,
    pub skip_conflicts: bool,
    pub skip_deletes: bool,
    pub limit: Option<usize>,
}

impl HeadsSelector {
    pub fn of_id(id: ItemId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
}

/// Where a read stream starts.
#[derive(Clone, Debug, Default)]
pub enum ReadPosition {
    #[default]
    Beginning,
    /// Just after the given version (exclusive).
    After(Version),
    /// At the given version (inclusive).
    At(Version),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TreeStats {
    pub name: String,
    pub items: u64,
    pub heads: u64,
}

#[derive(Debug, Default)]
struct WriterState {
    /// Next sequence to assign; `None` until loaded from the store.
    next_seq: Option<u64>,
}

/// One append-only versioned store. See the module docs for the index
/// layout. Writes are serialized through a single-writer lock; reads may run
/// concurrently.
#[derive(Debug)]
pub struct Tree {
    store: Arc<dyn KvStore>,
    name: String,
    perspective: Option<String>,
    version_size: usize,
    writer: tokio::sync::Mutex<WriterState>,
    in_flight: Mutex<HashMap<Vec<u8>, usize>>,
    committed: Arc<Notify>,
}

impl Tree {
    /// Opens the named tree inside `store`. `perspective` is the `pe` value
    /// items in this tree carry; the local and staging trees pass `None`.
    pub fn new(
        store: Arc<dyn KvStore>,
        name: impl Into<String>,
        perspective: Option<String>,
        version_size: usize,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            perspective,
            version_size,
            writer: tokio::sync::Mutex::new(WriterState::default()),
            in_flight: Mutex::new(HashMap::new()),
            committed: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn perspective(&self) -> Option<&str> {
        self.perspective.as_deref()
    }

    pub fn version_size(&self) -> usize {
        self.version_size
    }

    /// Writes one item. The full index update is one atomic batch.
    pub async fn write(&self, item: Item) -> TreeResult<Item> {
        let mut written = self.write_all(vec![item], Batch::new()).await?;
        Ok(written.pop().unwrap())
    }

    /// Writes a group of items plus caller-provided rows in one atomic
    /// batch. Later items may name earlier items of the same group as
    /// parents. Sequences are assigned in submission order.
    pub(crate) async fn write_all(
        &self,
        items: Vec<Item>,
        mut extra: Batch,
    ) -> TreeResult<Vec<Item>> {
        assert!(!items.is_empty(), "write_all requires at least one item");
        for item in &items {
            item.validate(self.version_size)?;
            if item.header.pe.as_deref() != self.perspective.as_deref() {
                return Err(MalformedItemError::PerspectiveMismatch {
                    expected: self.perspective.clone(),
                    actual: item.header.pe.clone(),
                }
                .into());
            }
        }

        let _guard = FlightGuard::register(self, &items);
        let mut writer = self.writer.lock().await;

        let mut batch_versions: HashSet<&Version> = HashSet::new();
        for item in &items {
            let v = &item.header.v;
            if batch_versions.contains(v) || self.contains_version(v)? {
                return Err(TreeError::DuplicateVersion { v: v.clone() });
            }
            for pa in &item.header.pa {
                if !batch_versions.contains(pa) && !self.contains_version(pa)? {
                    return Err(TreeError::MissingParent { v: pa.clone() });
                }
            }
            batch_versions.insert(v);
        }

        let first_seq = match writer.next_seq {
            Some(seq) => seq,
            None => self.load_next_seq()?,
        };

        let mut seq = first_seq;
        let mut written = Vec::with_capacity(items.len());
        for mut item in items {
            item.header.i = Some(seq);
            let encoded = bson::to_vec(&item).map_err(TreeError::corrupt)?;
            let header = &item.header;
            extra.put(keys::version_key(&self.name, &header.v), encoded);
            extra.put(
                keys::id_key(&self.name, &header.id, seq),
                header.v.to_bytes(),
            );
            extra.put(keys::seq_key(&self.name, seq), header.v.to_bytes());
            for pa in &header.pa {
                extra.delete(keys::head_key(&self.name, &header.id, pa));
            }
            extra.put(keys::head_key(&self.name, &header.id, &header.v), vec![]);
            seq += 1;
            written.push(item);
        }

        // The batch commit is the write's suspension point; until it lands,
        // concurrent head lookups observe the in-flight buffer instead of a
        // stale head set.
        tokio::task::yield_now().await;
        self.store.write(extra)?;
        writer.next_seq = Some(seq);
        Ok(written)
    }

    fn load_next_seq(&self) -> TreeResult<u64> {
        let last = self
            .store
            .last_in_prefix(&keys::tag_prefix(&self.name, keys::TAG_SEQ))?;
        match last {
            Some((key, _)) => {
                let seq = keys::seq_of_key(&key)
                    .ok_or_else(|| TreeError::corrupt("truncated sequence key"))?;
                Ok(seq + 1)
            }
            None => Ok(1),
        }
    }

    pub fn contains_version(&self, v: &Version) -> TreeResult<bool> {
        Ok(self.store.contains(&keys::version_key(&self.name, v))?)
    }

    /// Returns the item with the given version, or `None`.
    pub fn get_by_version(&self, v: &Version) -> TreeResult<Option<Item>> {
        match self.store.get(&keys::version_key(&self.name, v))? {
            Some(bytes) => Ok(Some(decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`Tree::get_by_version`] but failing on absence.
    pub fn expect_version(&self, v: &Version) -> TreeResult<Item> {
        self.get_by_version(v)?
            .ok_or_else(|| TreeError::VersionNotFound { v: v.clone() })
    }

    /// Visits heads matching the selector one at a time. The visitor may
    /// abort the walk with [`ControlFlow::Break`].
    pub fn get_heads(
        &self,
        selector: &HeadsSelector,
        mut visit: impl FnMut(Item) -> ControlFlow<()>,
    ) -> TreeResult<()> {
        let scan_prefix = match &selector.id {
            Some(id) => keys::heads_prefix(&self.name, id),
            None => keys::tag_prefix(&self.name, keys::TAG_HEAD),
        };
        let mut remaining = selector.limit.unwrap_or(usize::MAX);
        for entry in self.store.scan_prefix(&scan_prefix) {
            if remaining == 0 {
                break;
            }
            let (key, _) = entry?;
            let (id, v) = keys::split_head_key(&self.name, &key)
                .ok_or_else(|| TreeError::corrupt("truncated head key"))?;
            if let Some(prefix) = &selector.prefix
                && !id.as_bytes().starts_with(prefix)
            {
                continue;
            }
            let item = self.expect_version(&v)?;
            if selector.skip_conflicts && item.is_conflict_marker() {
                continue;
            }
            if selector.skip_deletes && item.is_tombstone() {
                continue;
            }
            remaining -= 1;
            let flow = visit(item);
            // A prefix query answers "does any such head exist".
            if flow.is_break() || selector.prefix.is_some() {
                break;
            }
        }
        Ok(())
    }

    /// All heads of `id`, conflict markers included.
    pub fn heads_of(&self, id: &ItemId) -> TreeResult<Vec<Item>> {
        let mut heads = vec![];
        self.get_heads(&HeadsSelector::of_id(id.clone()), |item| {
            heads.push(item);
            ControlFlow::Continue(())
        })?;
        Ok(heads)
    }

    pub fn is_head(&self, id: &ItemId, v: &Version) -> TreeResult<bool> {
        Ok(self.store.contains(&keys::head_key(&self.name, id, v))?)
    }

    /// All versions of `id` in insertion order.
    pub fn versions_of(&self, id: &ItemId) -> TreeResult<Vec<Item>> {
        let mut items = vec![];
        for entry in self.store.scan_prefix(&keys::id_prefix(&self.name, id)) {
            let (_, value) = entry?;
            items.push(self.expect_version(&Version::new(value))?);
        }
        Ok(items)
    }

    /// The version with the largest `i`, or `None` for an empty tree.
    pub fn last_version(&self) -> TreeResult<Option<Version>> {
        let last = self
            .store
            .last_in_prefix(&keys::tag_prefix(&self.name, keys::TAG_SEQ))?;
        Ok(last.map(|(_, value)| Version::new(value)))
    }

    /// True while a write for `id` has been submitted but not yet committed.
    pub fn in_buffer(&self, id: &ItemId) -> bool {
        self.in_flight.lock().unwrap().contains_key(id.as_bytes())
    }

    /// Waits until no write for `id` is in flight, up to `budget`.
    pub async fn wait_for_flush(&self, id: &ItemId, budget: Duration) -> TreeResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            if !self.in_buffer(id) {
                return Ok(());
            }
            let committed = self.committed.notified();
            if !self.in_buffer(id) {
                return Ok(());
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(TreeError::FlushTimeout { id: id.clone() });
            };
            // Losing the race against the notifier just means another lap.
            let _ = tokio::time::timeout(remaining, committed).await;
        }
    }

    /// The first item with sequence greater than `offset`, or `None`.
    pub fn item_after(&self, offset: u64) -> TreeResult<Option<Item>> {
        let prefix = keys::tag_prefix(&self.name, keys::TAG_SEQ);
        let start = keys::seq_key(&self.name, offset.saturating_add(1));
        match self.store.scan_from(&start).next() {
            Some(entry) => {
                let (key, value) = entry?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                Ok(Some(self.expect_version(&Version::new(value))?))
            }
            None => Ok(None),
        }
    }

    /// Waits for in-flight writes to finish. New writes queue behind the
    /// caller, so this is a drain point, not a barrier.
    pub(crate) async fn drain(&self) {
        let _writer = self.writer.lock().await;
    }

    /// A lazy, restartable walk of the tree in insertion order.
    pub fn read_items(&self, position: ReadPosition, tail: bool) -> ItemReadStream<'_> {
        ItemReadStream {
            tree: self,
            position,
            next_seq: None,
            tail,
        }
    }

    pub(crate) fn get_meta(&self, name: &str) -> TreeResult<Option<Vec<u8>>> {
        Ok(self.store.get(&keys::meta_key(&self.name, name))?)
    }

    pub(crate) fn put_meta_op(&self, name: &str, value: Vec<u8>, batch: &mut Batch) {
        batch.put(keys::meta_key(&self.name, name), value);
    }

    pub fn stats(&self) -> TreeResult<TreeStats> {
        let mut items = 0;
        for entry in self
            .store
            .scan_prefix(&keys::tag_prefix(&self.name, keys::TAG_SEQ))
        {
            entry?;
            items += 1;
        }
        let mut heads = 0;
        for entry in self
            .store
            .scan_prefix(&keys::tag_prefix(&self.name, keys::TAG_HEAD))
        {
            entry?;
            heads += 1;
        }
        Ok(TreeStats {
            name: self.name.clone(),
            items,
            heads,
        })
    }

    /// Deletes every row of this tree. Used when a perspective is removed
    /// from the configuration.
    pub async fn clear(&self) -> TreeResult<u64> {
        let mut writer = self.writer.lock().await;
        let mut deleted = 0;
        loop {
            let mut batch = Batch::new();
            for entry in self.store.scan_prefix(&keys::tree_prefix(&self.name)) {
                let (key, _) = entry?;
                batch.delete(key);
                if batch.len() >= 512 {
                    break;
                }
            }
            if batch.is_empty() {
                break;
            }
            deleted += batch.len() as u64;
            self.store.write(batch)?;
        }
        writer.next_seq = Some(1);
        Ok(deleted)
    }
}

fn decode_item(bytes: &[u8]) -> TreeResult<Item> {
    bson::from_slice(bytes).map_err(TreeError::corrupt)
}

/// Keeps the in-flight buffer accurate across both successful and failed
/// writes.
struct FlightGuard<'a> {
    tree: &'a Tree,
    ids: Vec<Vec<u8>>,
}

impl<'a> FlightGuard<'a> {
    fn register(tree: &'a Tree, items: &[Item]) -> Self {
        let ids: Vec<Vec<u8>> = items
            .iter()
            .map(|item| item.header.id.to_bytes())
            .collect();
        let mut in_flight = tree.in_flight.lock().unwrap();
        for id in &ids {
            *in_flight.entry(id.clone()).or_insert(0) += 1;
        }
        Self { tree, ids }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.tree.in_flight.lock().unwrap();
        for id in &self.ids {
            if let Some(count) = in_flight.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    in_flight.remove(id);
                }
            }
        }
        drop(in_flight);
        self.tree.committed.notify_waiters();
    }
}

/// Insertion-order walk over a tree. In tail mode the stream never ends;
/// after draining it waits for the next committed write and continues.
pub struct ItemReadStream<'a> {
    tree: &'a Tree,
    position: ReadPosition,
    next_seq: Option<u64>,
    tail: bool,
}

impl ItemReadStream<'_> {
    /// The next item, or `None` when the stream is exhausted (never in tail
    /// mode).
    pub async fn try_next(&mut self) -> TreeResult<Option<Item>> {
        let mut next_seq = match self.next_seq {
            Some(seq) => seq,
            None => self.resolve_start()?,
        };
        self.next_seq = Some(next_seq);
        loop {
            let committed = self.tree.committed.notified();
            match self.fetch(next_seq)? {
                Some(item) => {
                    self.next_seq = Some(next_seq + 1);
                    return Ok(Some(item));
                }
                None if self.tail => {
                    committed.await;
                    next_seq = self.next_seq.unwrap();
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    fn resolve_start(&self) -> TreeResult<u64> {
        match &self.position {
            ReadPosition::Beginning => Ok(1),
            ReadPosition::After(v) => {
                let item = self.tree.expect_version(v)?;
                Ok(item.header.i.unwrap_or(0) + 1)
            }
            ReadPosition::At(v) => {
                let item = self.tree.expect_version(v)?;
                Ok(item.header.i.unwrap_or(1))
            }
        }
    }

    fn fetch(&self, seq: u64) -> TreeResult<Option<Item>> {
        let key = keys::seq_key(self.tree.name(), seq);
        match self.tree.store.get(&key)? {
            Some(value) => Ok(Some(self.tree.expect_version(&Version::new(value))?)),
            None => Ok(None),
        }
    }
}
