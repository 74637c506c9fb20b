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

//! The merge engine: one local history lifted out of N remote histories.
//!
//! A [`MergeTree`] owns the local tree, a staging tree, and one tree per
//! configured perspective. Remote items stream into their perspective tree;
//! the merge stream pairs each new remote item with the current local head
//! of its id and lifts it into the local tree as a fast-forward, an
//! adoption, or a synthesized two-parent merge. Merges that cannot be
//! resolved become rows in the conflict store instead of local items.
//!
//! Every lift allocates a fresh local version. The `remoteToLocal` side
//! table records which local version a remote version became; the lowest
//! common ancestor walk uses it to relate the two DAGs.

use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bson::Document;
use itertools::Itertools as _;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::debug;
use tracing::warn;

use crate::conflicts::ConflictStore;
use crate::conflicts::ConflictStoreError;
use crate::conflicts::StoredConflict;
use crate::item::Header;
use crate::item::Item;
use crate::item::MalformedItemError;
use crate::kv::Batch;
use crate::kv::KvError;
use crate::kv::KvStore;
use crate::merge::MergeOutcome;
use crate::merge::MergeSide;
use crate::merge::merge_bodies;
use crate::tree::Tree;
use crate::tree::TreeError;
use crate::tree::TreeStats;
use crate::version::ItemId;
use crate::version::Version;
use crate::version::VersionAllocator;
use crate::wire::ItemReader;
use crate::wire::WireError;

/// Reserved name of the local tree.
pub const LOCAL_TREE: &str = "_local";
/// Reserved name of the staging tree, kept for interrupted-merge recovery.
pub const STAGE_TREE: &str = "_stage";

/// How long a head lookup waits for an in-flight write to land.
const HEAD_LOOKUP_RETRY_BUDGET: Duration = Duration::from_millis(100);

/// Meta key under each perspective tree: last remote sequence the merge
/// stream has fully processed.
const MERGE_OFFSET_META: &str = "merge";

pub type MergeTreeResult<T> = Result<T, MergeTreeError>;

#[derive(Debug, Error)]
pub enum MergeTreeError {
    #[error("unknown perspective {name:?}")]
    UnknownPerspective { name: String },
    #[error("perspective name {name:?} is reserved")]
    ReservedName { name: String },
    #[error("a local write stream is already open")]
    LocalWriterBusy,
    #[error("auto-merge is engaged")]
    AlreadyAutoMerging,
    #[error("multiple non-conflict heads for {id}")]
    HeadAmbiguous { id: ItemId },
    #[error("merge tree is closed")]
    Closed,
    #[error(transparent)]
    Conflicts(#[from] ConflictStoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Construction-time options, typically taken from the db configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeTreeOptions {
    pub version_size: usize,
    pub perspectives: Vec<String>,
}

impl Default for MergeTreeOptions {
    fn default() -> Self {
        Self {
            version_size: crate::version::DEFAULT_VERSION_SIZE,
            perspectives: vec![],
        }
    }
}

/// How one remote item lifts into the local tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeKind {
    /// First version of this id locally; the remote content starts the
    /// local history.
    Adopt,
    /// The remote item descends from the local head.
    FastForward,
    /// True three-way merge over the given lowest common ancestors.
    Merge { lcas: Vec<Version> },
}

/// One pending lift, produced by the merge stream and applied on
/// confirmation.
#[derive(Clone, Debug)]
pub struct MergeCandidate {
    pub perspective: String,
    /// The remote item as stored in its perspective tree.
    pub remote: Item,
    /// The local head it was paired with.
    pub local_head: Option<Item>,
    pub kind: MergeKind,
    /// Items to enter the local tree, in order. The last one is the new
    /// local head of the id.
    items: Vec<Item>,
    remote_seq: u64,
}

impl MergeCandidate {
    /// The item that will become the new local head of the id.
    pub fn merged_item(&self) -> &Item {
        self.items.last().unwrap()
    }
}

/// What the merge stream yields.
#[derive(Debug)]
pub enum MergeEvent {
    /// A lift waiting for confirmation.
    Candidate(MergeCandidate),
    /// A conflict row was written; no local item will be emitted for this
    /// remote item.
    ConflictRecorded {
        n: u64,
        perspective: String,
        id: ItemId,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoMergeSummary {
    pub merged: u64,
    pub conflicts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct MergeTreeStats {
    pub trees: Vec<TreeStats>,
    pub conflicts: u64,
}

/// How to settle a stored conflict.
#[derive(Clone, Debug)]
pub enum ConflictResolution {
    /// Keep the local side; the remote branch is joined but loses.
    KeepLocal,
    /// Take the remote side.
    TakeRemote,
    /// Use the given body (`None` resolves to a tombstone).
    Merged(Option<Document>),
}

/// The engine owning all trees of one db. See the module docs.
#[derive(Debug)]
pub struct MergeTree {
    store: Arc<dyn KvStore>,
    local: Tree,
    stage: Tree,
    remotes: BTreeMap<String, Tree>,
    conflicts: ConflictStore,
    allocator: VersionAllocator,
    local_writer: Arc<AtomicBool>,
    auto_merging: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MergeTree {
    /// Opens the engine over `store` with the configured perspectives.
    pub fn open(store: Arc<dyn KvStore>, options: MergeTreeOptions) -> MergeTreeResult<Self> {
        if options.version_size < 4 {
            warn!(
                version_size = options.version_size,
                "small version size; ids accumulating ~2^{} versions risk collisions",
                options.version_size * 4
            );
        }
        let mut remotes = BTreeMap::new();
        for name in &options.perspectives {
            // Tree names carry a one-byte length prefix in every index key.
            if name.is_empty() || name.len() > 254 || name.starts_with('_') {
                return Err(MergeTreeError::ReservedName { name: name.clone() });
            }
            let tree = Tree::new(
                store.clone(),
                name.clone(),
                Some(name.clone()),
                options.version_size,
            );
            remotes.insert(name.clone(), tree);
        }
        Ok(Self {
            local: Tree::new(store.clone(), LOCAL_TREE, None, options.version_size),
            stage: Tree::new(store.clone(), STAGE_TREE, None, options.version_size),
            remotes,
            conflicts: ConflictStore::new(store.clone()),
            allocator: VersionAllocator::new(options.version_size),
            store,
            local_writer: Arc::new(AtomicBool::new(false)),
            auto_merging: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_tree(&self) -> &Tree {
        &self.local
    }

    pub fn stage_tree(&self) -> &Tree {
        &self.stage
    }

    pub fn remote_tree(&self, perspective: &str) -> MergeTreeResult<&Tree> {
        self.remotes
            .get(perspective)
            .ok_or_else(|| MergeTreeError::UnknownPerspective {
                name: perspective.to_string(),
            })
    }

    pub fn perspectives(&self) -> impl Iterator<Item = &str> {
        self.remotes.keys().map(String::as_str)
    }

    pub fn conflict_store(&self) -> &ConflictStore {
        &self.conflicts
    }

    fn ensure_open(&self) -> MergeTreeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MergeTreeError::Closed)
        } else {
            Ok(())
        }
    }

    /// Store I/O failures poison the engine; everything after them fails
    /// with [`MergeTreeError::Closed`].
    fn check<T>(&self, result: MergeTreeResult<T>) -> MergeTreeResult<T> {
        if let Err(err) = &result {
            let fatal = matches!(
                err,
                MergeTreeError::Store(KvError::Io { .. })
                    | MergeTreeError::Tree(TreeError::Store(KvError::Io { .. }))
                    | MergeTreeError::Conflicts(ConflictStoreError::Store(KvError::Io { .. }))
            );
            if fatal {
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Opens the write stream for one perspective. Multiple remote streams
    /// may be open at once; each one back-pressures on the store.
    pub fn create_remote_write_stream(
        &self,
        perspective: &str,
    ) -> MergeTreeResult<RemoteWriteStream<'_>> {
        self.ensure_open()?;
        let tree = self.remote_tree(perspective)?;
        Ok(RemoteWriteStream {
            merge_tree: self,
            tree,
            perspective: perspective.to_string(),
        })
    }

    /// Opens the exclusive local write stream.
    pub fn create_local_write_stream(&self) -> MergeTreeResult<LocalWriteStream<'_>> {
        self.ensure_open()?;
        if self.auto_merging.load(Ordering::SeqCst) {
            return Err(MergeTreeError::AlreadyAutoMerging);
        }
        let permit = WriterPermit::acquire(&self.local_writer)?;
        Ok(LocalWriteStream {
            merge_tree: self,
            _permit: permit,
        })
    }

    /// Starts a merge pass: a lazy sequence of [`MergeEvent`]s covering
    /// every remote item not yet lifted, in remote insertion order per
    /// perspective.
    ///
    /// Confirm each candidate before requesting the next; an unconfirmed
    /// lift makes its descendants merge against older state.
    pub fn start_merge(&self) -> MergeStream<'_> {
        MergeStream {
            merge_tree: self,
            perspectives: self.remotes.keys().cloned().collect(),
            current: 0,
            offset: None,
        }
    }

    /// Runs one merge pass, confirming every candidate into the local tree.
    /// Conflicts go to the conflict store and are counted, not raised.
    pub async fn auto_merge(&self) -> MergeTreeResult<AutoMergeSummary> {
        self.ensure_open()?;
        let _merging = MergingPermit::acquire(&self.auto_merging)?;
        let _writer = WriterPermit::acquire(&self.local_writer)?;

        let mut summary = AutoMergeSummary::default();
        let mut stream = self.start_merge();
        while let Some(event) = stream.next_event().await? {
            match event {
                MergeEvent::Candidate(candidate) => {
                    let result = self.apply_candidate(candidate).await;
                    self.check(result)?;
                    summary.merged += 1;
                }
                MergeEvent::ConflictRecorded { n, perspective, id } => {
                    debug!(n, perspective = %perspective, id = %id, "conflict recorded");
                    summary.conflicts += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Single-item lookup over the local tree, racing the write buffer as
    /// needed. Returns `None` iff no non-deleted, non-conflict head exists.
    pub async fn head(&self, id: &ItemId) -> MergeTreeResult<Option<Item>> {
        self.ensure_open()?;
        if self.local.in_buffer(id) {
            let result = self
                .local
                .wait_for_flush(id, HEAD_LOOKUP_RETRY_BUDGET)
                .await;
            self.check(result.map_err(MergeTreeError::from))?;
        }
        let mut heads = vec![];
        self.local.get_heads(
            &crate::tree::HeadsSelector {
                id: Some(id.clone()),
                skip_conflicts: true,
                skip_deletes: true,
                ..Default::default()
            },
            |item| {
                heads.push(item);
                if heads.len() > 1 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )?;
        match heads.len() {
            0 => Ok(None),
            1 => Ok(Some(heads.pop().unwrap())),
            _ => Err(MergeTreeError::HeadAmbiguous { id: id.clone() }),
        }
    }

    /// The first non-deleted, non-conflict local head whose id starts with
    /// `prefix`, or `None`.
    pub fn prefix_exists(&self, prefix: &[u8]) -> MergeTreeResult<Option<Item>> {
        self.ensure_open()?;
        let mut found = None;
        self.local.get_heads(
            &crate::tree::HeadsSelector {
                prefix: Some(prefix.to_vec()),
                skip_conflicts: true,
                skip_deletes: true,
                ..Default::default()
            },
            |item| {
                found = Some(item);
                ControlFlow::Break(())
            },
        )?;
        Ok(found)
    }

    /// Visits stored conflicts in key order.
    pub fn get_conflicts(
        &self,
        visit: impl FnMut(u64, StoredConflict) -> ControlFlow<()>,
    ) -> MergeTreeResult<()> {
        self.ensure_open()?;
        Ok(self.conflicts.for_each(visit)?)
    }

    pub fn get_conflict(&self, n: u64) -> MergeTreeResult<Option<StoredConflict>> {
        self.ensure_open()?;
        Ok(self.conflicts.get(n)?)
    }

    /// Settles a stored conflict: lifts the remote item, joins it with the
    /// current local head under the chosen body, and deletes the row. All
    /// of it is one atomic batch.
    pub async fn resolve_conflict(
        &self,
        n: u64,
        resolution: ConflictResolution,
    ) -> MergeTreeResult<Item> {
        self.ensure_open()?;
        let _writer = WriterPermit::acquire(&self.local_writer)?;
        let conflict = self.conflicts.expect(n)?;
        let remote = &conflict.new_item;
        let id = &remote.header.id;

        let local_head = {
            let mut heads: Vec<Item> = self
                .local
                .heads_of(id)?
                .into_iter()
                .filter(|item| !item.is_conflict_marker())
                .collect();
            if heads.len() > 1 {
                return Err(MergeTreeError::HeadAmbiguous { id: id.clone() });
            }
            heads.pop()
        };

        let mut extra = Batch::new();
        let mut items = vec![];
        let remote_local_v = match self.lifted_version(&remote.header.v)? {
            Some(v) => v,
            None => {
                let lift = self.lift(remote, conflict.lcas.clone())?;
                let v = lift.header.v.clone();
                self.record_lift(&remote.header.v, &v, &mut extra);
                items.push(lift);
                v
            }
        };

        let (body, deleted) = match resolution {
            ConflictResolution::KeepLocal => match &local_head {
                Some(head) => (head.body.clone(), head.is_tombstone()),
                None => (remote.body.clone(), remote.is_tombstone()),
            },
            ConflictResolution::TakeRemote => (remote.body.clone(), remote.is_tombstone()),
            ConflictResolution::Merged(body) => {
                let deleted = body.is_none();
                (body, deleted)
            }
        };

        let mut parents = vec![];
        if let Some(head) = &local_head
            && head.header.v != remote_local_v
        {
            parents.push(head.header.v.clone());
        }
        parents.push(remote_local_v);

        let mut resolved = Item::new(
            id.clone(),
            self.fresh_version()?,
            parents,
            body,
        );
        resolved.header.d = deleted;
        items.push(resolved);

        self.conflicts.delete_op(n, &mut extra);
        let result = self.local.write_all(items, extra).await;
        let mut written = self.check(result.map_err(MergeTreeError::from))?;
        Ok(written.pop().unwrap())
    }

    /// Per-tree and conflict counts, for the stats dump.
    pub fn stats(&self) -> MergeTreeResult<MergeTreeStats> {
        self.ensure_open()?;
        let trees = [&self.local, &self.stage]
            .into_iter()
            .chain(self.remotes.values())
            .map(|tree| tree.stats())
            .try_collect()?;
        Ok(MergeTreeStats {
            trees,
            conflicts: self.conflicts.len()?,
        })
    }

    /// Drains writers and flushes the store. Idempotent; every later
    /// operation fails with [`MergeTreeError::Closed`].
    pub async fn close(&self) -> MergeTreeResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.local.drain().await;
        self.stage.drain().await;
        for tree in self.remotes.values() {
            tree.drain().await;
        }
        self.store.persist()?;
        Ok(())
    }

    fn fresh_version(&self) -> MergeTreeResult<Version> {
        Ok(self
            .allocator
            .fresh_where(|v| self.local.contains_version(v))?)
    }

    /// The local version a remote version became, if it was ever lifted.
    /// Identity counts: an item that originated here and echoed back keeps
    /// its version.
    fn lifted_version(&self, v: &Version) -> MergeTreeResult<Option<Version>> {
        if self.local.contains_version(v)? {
            return Ok(Some(v.clone()));
        }
        Ok(self
            .local
            .get_meta(&remote_map_meta(v))?
            .map(Version::new))
    }

    fn record_lift(&self, remote_v: &Version, local_v: &Version, batch: &mut Batch) {
        self.local
            .put_meta_op(&remote_map_meta(remote_v), local_v.to_bytes(), batch);
    }

    /// Copies a remote item into local form: fresh version, parents mapped
    /// into local space (falling back to the given ancestors when a parent
    /// was never lifted), perspective and sequence cleared.
    fn lift(&self, remote: &Item, fallback_parents: Vec<Version>) -> MergeTreeResult<Item> {
        let mut parents = vec![];
        for pa in &remote.header.pa {
            match self.lifted_version(pa)? {
                Some(v) => parents.push(v),
                None => {
                    parents = fallback_parents;
                    break;
                }
            }
        }
        parents.dedup();
        parents.truncate(crate::item::MAX_PARENTS);
        Ok(Item {
            header: Header {
                id: remote.header.id.clone(),
                v: self.fresh_version()?,
                pa: parents.into_iter().collect(),
                pe: None,
                i: None,
                d: remote.header.d,
                c: remote.header.c,
            },
            body: remote.body.clone(),
            meta: remote.meta.clone(),
        })
    }

    /// Writes a confirmed candidate: the lifted items, the `remoteToLocal`
    /// row and the merge offset advance, all in one batch.
    async fn apply_candidate(&self, candidate: MergeCandidate) -> MergeTreeResult<Item> {
        self.ensure_open()?;
        let remote_v = &candidate.remote.header.v;
        let tree = self.remote_tree(&candidate.perspective)?;
        if let Some(v) = self.lifted_version(remote_v)? {
            // Already applied (a replayed candidate); just move the offset.
            let mut batch = Batch::new();
            tree.put_meta_op(
                MERGE_OFFSET_META,
                candidate.remote_seq.to_be_bytes().to_vec(),
                &mut batch,
            );
            self.store.write(batch)?;
            return Ok(self.local.expect_version(&v)?);
        }

        let mut extra = Batch::new();
        // The lift target of the remote version is its local copy: the
        // first item for a true merge, the only item otherwise.
        let lift_v = candidate.items.first().unwrap().header.v.clone();
        self.record_lift(remote_v, &lift_v, &mut extra);
        tree.put_meta_op(
            MERGE_OFFSET_META,
            candidate.remote_seq.to_be_bytes().to_vec(),
            &mut extra,
        );
        let mut written = self.local.write_all(candidate.items, extra).await?;
        Ok(written.pop().unwrap())
    }

    /// Computes what lifting `remote` means against the current local
    /// state: a candidate, or a conflict to be recorded.
    fn evaluate(
        &self,
        perspective: &str,
        remote: &Item,
        remote_seq: u64,
    ) -> MergeTreeResult<Result<MergeCandidate, StoredConflict>> {
        let id = &remote.header.id;
        let mut local_heads: Vec<Item> = self
            .local
            .heads_of(id)?
            .into_iter()
            .filter(|item| !item.is_conflict_marker())
            .collect();
        if local_heads.len() > 1 {
            return Err(MergeTreeError::HeadAmbiguous { id: id.clone() });
        }
        let local_head = local_heads.pop();

        let Some(local_head) = local_head else {
            // First version of this id locally.
            let lift = self.lift(remote, vec![])?;
            return Ok(Ok(MergeCandidate {
                perspective: perspective.to_string(),
                remote: remote.clone(),
                local_head: None,
                kind: MergeKind::Adopt,
                items: vec![lift],
                remote_seq,
            }));
        };

        let tree = self.remote_tree(perspective)?;
        let lcas = self.find_lcas(tree, remote, &local_head)?;
        if lcas.is_empty() {
            return Ok(Err(StoredConflict {
                new_item: remote.clone(),
                local_head: Some(local_head),
                merge_attempt: None,
                lcas: vec![],
                perspective: perspective.to_string(),
                error: "no common ancestor".to_string(),
            }));
        }

        if lcas.contains(&local_head.header.v) {
            // The remote item descends from the local head.
            let mut lift = self.lift(remote, vec![local_head.header.v.clone()])?;
            lift.header.pa = [local_head.header.v.clone()].into_iter().collect();
            return Ok(Ok(MergeCandidate {
                perspective: perspective.to_string(),
                remote: remote.clone(),
                local_head: Some(local_head),
                kind: MergeKind::FastForward,
                items: vec![lift],
                remote_seq,
            }));
        }

        let lca_item = self.local.expect_version(&lcas[0])?;
        let lca_body = if lca_item.is_tombstone() {
            None
        } else {
            lca_item.body.as_ref()
        };
        let outcome = merge_bodies(
            lca_body,
            MergeSide {
                body: local_head.body.as_ref(),
                deleted: local_head.is_tombstone(),
            },
            MergeSide {
                body: remote.body.as_ref(),
                deleted: remote.is_tombstone(),
            },
        );
        match outcome {
            MergeOutcome::Resolved { body, deleted } => {
                let lift = self.lift(remote, lcas.clone())?;
                let mut merged = Item::new(
                    id.clone(),
                    self.fresh_version()?,
                    [local_head.header.v.clone(), lift.header.v.clone()],
                    body,
                );
                merged.header.d = deleted;
                Ok(Ok(MergeCandidate {
                    perspective: perspective.to_string(),
                    remote: remote.clone(),
                    local_head: Some(local_head),
                    kind: MergeKind::Merge { lcas },
                    items: vec![lift, merged],
                    remote_seq,
                }))
            }
            MergeOutcome::Conflict(reason) => Ok(Err(StoredConflict {
                new_item: remote.clone(),
                local_head: Some(local_head),
                merge_attempt: None,
                lcas,
                perspective: perspective.to_string(),
                error: reason.to_string(),
            })),
        }
    }

    /// Walks ancestors of `remote` (in its perspective tree) and of
    /// `local_head` (in the local tree) in reverse insertion order,
    /// relating the two DAGs through `remoteToLocal`. Returns the first
    /// version seen on both sides, in local space.
    fn find_lcas(
        &self,
        remote_tree: &Tree,
        remote: &Item,
        local_head: &Item,
    ) -> MergeTreeResult<Vec<Version>> {
        let mut remote_frontier: BinaryHeap<(u64, Version)> = BinaryHeap::new();
        let mut local_frontier: BinaryHeap<(u64, Version)> = BinaryHeap::new();
        let mut remote_seen: HashSet<Version> = HashSet::new();
        let mut local_seen: HashSet<Version> = HashSet::new();
        let mut remote_equivs: HashSet<Version> = HashSet::new();

        remote_frontier.push((remote.header.i.unwrap_or(0), remote.header.v.clone()));
        local_frontier.push((local_head.header.i.unwrap_or(0), local_head.header.v.clone()));

        loop {
            if remote_frontier.is_empty() && local_frontier.is_empty() {
                return Ok(vec![]);
            }
            if let Some((_, v)) = remote_frontier.pop() {
                if remote_seen.insert(v.clone()) {
                    if let Some(equiv) = self.lifted_version(&v)? {
                        if local_seen.contains(&equiv) {
                            return Ok(vec![equiv]);
                        }
                        remote_equivs.insert(equiv);
                    }
                    let item = remote_tree.expect_version(&v)?;
                    for pa in &item.header.pa {
                        let parent = remote_tree.expect_version(pa)?;
                        remote_frontier.push((parent.header.i.unwrap_or(0), pa.clone()));
                    }
                }
            }
            if let Some((_, v)) = local_frontier.pop() {
                if local_seen.insert(v.clone()) {
                    if remote_equivs.contains(&v) {
                        return Ok(vec![v]);
                    }
                    let item = self.local.expect_version(&v)?;
                    for pa in &item.header.pa {
                        let parent = self.local.expect_version(pa)?;
                        local_frontier.push((parent.header.i.unwrap_or(0), pa.clone()));
                    }
                }
            }
        }
    }
}

fn remote_map_meta(v: &Version) -> String {
    format!("rl:{}", v.base64())
}

/// Clears a busy flag on drop.
#[derive(Debug)]
struct WriterPermit {
    flag: Arc<AtomicBool>,
}

impl WriterPermit {
    fn acquire(flag: &Arc<AtomicBool>) -> MergeTreeResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MergeTreeError::LocalWriterBusy);
        }
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct MergingPermit {
    flag: Arc<AtomicBool>,
}

impl MergingPermit {
    fn acquire(flag: &Arc<AtomicBool>) -> MergeTreeResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MergeTreeError::AlreadyAutoMerging);
        }
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for MergingPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Ingests items for one perspective. Incoming items must either carry the
/// stream's perspective or none (the stream stamps it in). Re-sent items
/// that already exist are skipped, which makes resumed replication
/// idempotent.
#[derive(Debug)]
pub struct RemoteWriteStream<'a> {
    merge_tree: &'a MergeTree,
    tree: &'a Tree,
    perspective: String,
}

impl RemoteWriteStream<'_> {
    pub fn perspective(&self) -> &str {
        &self.perspective
    }

    /// Writes one item into the perspective tree. Returns `true` when the
    /// item was new.
    pub async fn write(&mut self, mut item: Item) -> MergeTreeResult<bool> {
        self.merge_tree.ensure_open()?;
        match &item.header.pe {
            None => item.header.pe = Some(self.perspective.clone()),
            Some(pe) if *pe == self.perspective => {}
            Some(pe) => {
                return Err(TreeError::from(MalformedItemError::PerspectiveMismatch {
                    expected: Some(self.perspective.clone()),
                    actual: Some(pe.clone()),
                })
                .into());
            }
        }
        // Sequences are per-tree; whatever the peer assigned does not
        // survive the transport.
        item.header.i = None;
        if self.tree.contains_version(&item.header.v)? {
            debug!(v = %item.header.v, perspective = %self.perspective, "skipping known version");
            return Ok(false);
        }
        let result = self.tree.write(item).await.map(|_| true);
        self.merge_tree.check(result.map_err(MergeTreeError::from))
    }

    /// Decodes BSON items from `reader` until end of stream, writing each
    /// into the perspective tree. Returns the number of new items.
    pub async fn copy_from<R: AsyncRead + Unpin + Send>(
        &mut self,
        reader: R,
    ) -> MergeTreeResult<u64> {
        let mut items = ItemReader::new(reader);
        let mut new_items = 0;
        while let Some(item) = items.read_item().await? {
            if self.write(item).await? {
                new_items += 1;
            }
        }
        Ok(new_items)
    }

    /// The resume point to offer the peer: the last version stored for this
    /// perspective.
    pub fn last_version(&self) -> MergeTreeResult<Option<Version>> {
        Ok(self.tree.last_version()?)
    }
}

/// The exclusive local writer: locally-authored items and merge
/// confirmations. Dropping the stream releases the slot.
#[derive(Debug)]
pub struct LocalWriteStream<'a> {
    merge_tree: &'a MergeTree,
    _permit: WriterPermit,
}

impl LocalWriteStream<'_> {
    /// Writes one locally-authored item into the local tree.
    pub async fn write(&mut self, item: Item) -> MergeTreeResult<Item> {
        self.merge_tree.ensure_open()?;
        let result = self.merge_tree.local.write(item).await;
        self.merge_tree.check(result.map_err(MergeTreeError::from))
    }

    /// Confirms a merge candidate, entering its items into the local tree.
    pub async fn confirm(&mut self, candidate: MergeCandidate) -> MergeTreeResult<Item> {
        let result = self.merge_tree.apply_candidate(candidate).await;
        self.merge_tree.check(result)
    }
}

/// Lazy walk over not-yet-merged remote items, perspective by perspective.
pub struct MergeStream<'a> {
    merge_tree: &'a MergeTree,
    perspectives: Vec<String>,
    current: usize,
    /// In-memory continuation within the current perspective; the durable
    /// offset only advances on conflict or confirmation.
    offset: Option<u64>,
}

impl MergeStream<'_> {
    /// The next merge event, or `None` when every perspective is drained.
    pub async fn next_event(&mut self) -> MergeTreeResult<Option<MergeEvent>> {
        loop {
            self.merge_tree.ensure_open()?;
            let Some(perspective) = self.perspectives.get(self.current).cloned() else {
                return Ok(None);
            };
            let tree = self.merge_tree.remote_tree(&perspective)?;
            let offset = match self.offset {
                Some(offset) => offset,
                None => self.load_offset(tree)?,
            };

            let Some((seq, remote)) = next_remote_item(tree, offset)? else {
                self.current += 1;
                self.offset = None;
                continue;
            };
            self.offset = Some(seq);

            if self.merge_tree.lifted_version(&remote.header.v)?.is_some() {
                // Already merged earlier (e.g. a replayed stream); advance
                // durably and move on.
                self.advance(tree, seq)?;
                continue;
            }

            match self.merge_tree.evaluate(&perspective, &remote, seq)? {
                Ok(candidate) => return Ok(Some(MergeEvent::Candidate(candidate))),
                Err(conflict) => {
                    let id = conflict.new_item.header.id.clone();
                    let mut batch = Batch::new();
                    let n = self.merge_tree.conflicts.append_op(&conflict, &mut batch)?;
                    tree.put_meta_op(MERGE_OFFSET_META, seq.to_be_bytes().to_vec(), &mut batch);
                    let result = self.merge_tree.store.write(batch).map_err(MergeTreeError::from);
                    self.merge_tree.check(result)?;
                    return Ok(Some(MergeEvent::ConflictRecorded {
                        n,
                        perspective,
                        id,
                    }));
                }
            }
        }
    }

    fn load_offset(&self, tree: &Tree) -> MergeTreeResult<u64> {
        match tree.get_meta(MERGE_OFFSET_META)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
                    MergeTreeError::Tree(TreeError::Corrupt {
                        reason: "truncated merge offset".to_string(),
                    })
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn advance(&self, tree: &Tree, seq: u64) -> MergeTreeResult<()> {
        let mut batch = Batch::new();
        tree.put_meta_op(MERGE_OFFSET_META, seq.to_be_bytes().to_vec(), &mut batch);
        let result = self.merge_tree.store.write(batch).map_err(MergeTreeError::from);
        self.merge_tree.check(result)
    }
}

/// The first item in `tree` with sequence greater than `offset`.
fn next_remote_item(tree: &Tree, offset: u64) -> MergeTreeResult<Option<(u64, Item)>> {
    match tree.item_after(offset)? {
        Some(item) => {
            let seq = item.header.i.unwrap_or(0);
            Ok(Some((seq, item)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bson::doc;

    use super::*;
    use crate::memory_store::MemoryStore;

    fn engine(perspectives: &[&str]) -> MergeTree {
        MergeTree::open(
            Arc::new(MemoryStore::new()),
            MergeTreeOptions {
                version_size: 3,
                perspectives: perspectives.iter().map(|pe| pe.to_string()).collect(),
            },
        )
        .unwrap()
    }

    fn remote_item(id: &str, v: &'static str, pa: &[&'static str], body: Document) -> Item {
        Item::new(
            ItemId::from_str_id(id),
            Version::from_base64(v),
            pa.iter().map(|pa| Version::from_base64(pa)),
            Some(body),
        )
    }

    async fn ingest(engine: &MergeTree, perspective: &str, items: Vec<Item>) {
        let mut stream = engine.create_remote_write_stream(perspective).unwrap();
        for item in items {
            stream.write(item).await.unwrap();
        }
    }

    #[test]
    fn test_open_rejects_reserved_names() {
        let result = MergeTree::open(
            Arc::new(MemoryStore::new()),
            MergeTreeOptions {
                version_size: 3,
                perspectives: vec!["_local".to_string()],
            },
        );
        assert_matches!(result, Err(MergeTreeError::ReservedName { .. }));
    }

    #[test]
    fn test_unknown_perspective() {
        let engine = engine(&["peer"]);
        assert_matches!(
            engine.create_remote_write_stream("stranger"),
            Err(MergeTreeError::UnknownPerspective { .. })
        );
    }

    #[tokio::test]
    async fn test_adopt_then_fast_forward_chain() {
        let engine = engine(&["peer"]);
        ingest(
            &engine,
            "peer",
            vec![
                remote_item("abc", "Aaaa", &[], doc! {"some": true}),
                remote_item("abc", "Bbbb", &["Aaaa"], doc! {"some": "other"}),
            ],
        )
        .await;

        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(
            summary,
            AutoMergeSummary {
                merged: 2,
                conflicts: 0,
            }
        );

        let id = ItemId::from_str_id("abc");
        let head = engine.head(&id).await.unwrap().unwrap();
        assert_eq!(head.body, Some(doc! {"some": "other"}));
        // Lifts re-stamp; the remote versions do not leak into the local
        // tree.
        assert_ne!(head.header.v, Version::from_base64("Bbbb"));
        let chain = engine.local_tree().versions_of(&id).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].is_root());
        assert_eq!(chain[1].header.pa.as_slice(), &[chain[0].header.v.clone()]);

        // Replaying the same stream is a no-op.
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"some": true})],
        )
        .await;
        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary, AutoMergeSummary::default());
        assert_eq!(engine.local_tree().versions_of(&id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_true_merge_combines_divergent_edits() {
        let engine = engine(&["peer"]);
        // Shared root, then both sides edit different fields.
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"a": 1, "b": 1})],
        )
        .await;
        engine.auto_merge().await.unwrap();

        let id = ItemId::from_str_id("abc");
        let local_root = engine.head(&id).await.unwrap().unwrap();
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    id.clone(),
                    Version::from_base64("MMMM"),
                    [local_root.header.v.clone()],
                    Some(doc! {"a": 2, "b": 1}),
                ))
                .await
                .unwrap();
        }
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Cccc", &["Aaaa"], doc! {"a": 1, "b": 2})],
        )
        .await;

        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.conflicts, 0);

        let head = engine.head(&id).await.unwrap().unwrap();
        assert_eq!(head.body, Some(doc! {"a": 2, "b": 2}));
        assert_eq!(head.header.pa.len(), 2);
        assert_eq!(head.header.pa[0], Version::from_base64("MMMM"));
    }

    #[tokio::test]
    async fn test_conflicting_edits_are_quarantined() {
        let engine = engine(&["peer"]);
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"a": 1})],
        )
        .await;
        engine.auto_merge().await.unwrap();

        let id = ItemId::from_str_id("abc");
        let local_root = engine.head(&id).await.unwrap().unwrap();
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    id.clone(),
                    Version::from_base64("MMMM"),
                    [local_root.header.v.clone()],
                    Some(doc! {"a": 2}),
                ))
                .await
                .unwrap();
        }
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Cccc", &["Aaaa"], doc! {"a": 3})],
        )
        .await;

        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary.merged, 0);
        assert_eq!(summary.conflicts, 1);

        // No merged item; the local head is untouched.
        let head = engine.head(&id).await.unwrap().unwrap();
        assert_eq!(head.body, Some(doc! {"a": 2}));

        let conflict = engine.get_conflict(1).unwrap().unwrap();
        assert_eq!(conflict.perspective, "peer");
        assert!(conflict.error.contains('a'));
        assert_eq!(conflict.new_item.header.v, Version::from_base64("Cccc"));
        assert_eq!(conflict.lcas.len(), 1);

        // The next pass does not re-record the same conflict.
        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary, AutoMergeSummary::default());
        assert_eq!(engine.conflict_store().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_root_versus_root_conflict() {
        let engine = engine(&["peer"]);
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    ItemId::from_str_id("abc"),
                    Version::from_base64("MMMM"),
                    [],
                    Some(doc! {"mine": 1}),
                ))
                .await
                .unwrap();
        }
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"theirs": 1})],
        )
        .await;

        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary.conflicts, 1);
        let conflict = engine.get_conflict(1).unwrap().unwrap();
        assert_eq!(conflict.error, "no common ancestor");
        assert!(conflict.lcas.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_conflict_joins_histories() {
        let engine = engine(&["peer"]);
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"a": 1})],
        )
        .await;
        engine.auto_merge().await.unwrap();
        let id = ItemId::from_str_id("abc");
        let local_root = engine.head(&id).await.unwrap().unwrap();
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    id.clone(),
                    Version::from_base64("MMMM"),
                    [local_root.header.v.clone()],
                    Some(doc! {"a": 2}),
                ))
                .await
                .unwrap();
        }
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Cccc", &["Aaaa"], doc! {"a": 3})],
        )
        .await;
        engine.auto_merge().await.unwrap();

        let resolved = engine
            .resolve_conflict(1, ConflictResolution::Merged(Some(doc! {"a": 5})))
            .await
            .unwrap();
        assert_eq!(resolved.body, Some(doc! {"a": 5}));
        assert_eq!(resolved.header.pa.len(), 2);
        assert_eq!(engine.conflict_store().len().unwrap(), 0);

        // The resolution is the single head now.
        let head = engine.head(&id).await.unwrap().unwrap();
        assert_eq!(head.header.v, resolved.header.v);

        // And the remote version is mapped: replaying it merges nothing.
        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary, AutoMergeSummary::default());

        assert_matches!(
            engine.resolve_conflict(1, ConflictResolution::KeepLocal).await,
            Err(MergeTreeError::Conflicts(ConflictStoreError::NotFound { n: 1 }))
        );
    }

    #[tokio::test]
    async fn test_local_writer_is_exclusive() {
        let engine = engine(&[]);
        let first = engine.create_local_write_stream().unwrap();
        assert_matches!(
            engine.create_local_write_stream(),
            Err(MergeTreeError::LocalWriterBusy)
        );
        assert_matches!(
            engine.auto_merge().await,
            Err(MergeTreeError::LocalWriterBusy)
        );
        drop(first);
        let _second = engine.create_local_write_stream().unwrap();
    }

    #[tokio::test]
    async fn test_head_lookup_waits_for_in_flight_write() {
        let engine = engine(&[]);
        let id = ItemId::from_str_id("abc");
        let item = Item::new(
            id.clone(),
            Version::from_base64("Aaaa"),
            [],
            Some(doc! {"some": true}),
        );

        let (written, head) = {
            let mut local = engine.create_local_write_stream().unwrap();
            tokio::join!(local.write(item), engine.head(&id))
        };
        written.unwrap();
        assert_eq!(
            head.unwrap().unwrap().header.v,
            Version::from_base64("Aaaa")
        );
    }

    #[tokio::test]
    async fn test_head_lookup_rules() {
        let engine = engine(&[]);
        let id = ItemId::from_str_id("abc");
        assert_eq!(engine.head(&id).await.unwrap(), None);

        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    id.clone(),
                    Version::from_base64("Aaaa"),
                    [],
                    Some(doc! {"some": true}),
                ))
                .await
                .unwrap();
            // A tombstone head answers as absent.
            local
                .write(Item::new_tombstone(
                    id.clone(),
                    Version::from_base64("Bbbb"),
                    [Version::from_base64("Aaaa")],
                ))
                .await
                .unwrap();
        }
        assert_eq!(engine.head(&id).await.unwrap(), None);

        // Two non-conflict heads refuse to answer.
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    ItemId::from_str_id("dup"),
                    Version::from_base64("Cccc"),
                    [],
                    Some(doc! {"n": 1}),
                ))
                .await
                .unwrap();
            local
                .write(Item::new(
                    ItemId::from_str_id("dup"),
                    Version::from_base64("Dddd"),
                    [],
                    Some(doc! {"n": 2}),
                ))
                .await
                .unwrap();
        }
        assert_matches!(
            engine.head(&ItemId::from_str_id("dup")).await,
            Err(MergeTreeError::HeadAmbiguous { .. })
        );
    }

    #[tokio::test]
    async fn test_prefix_exists() {
        let engine = engine(&[]);
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new(
                    ItemId::from_str_id("user:1"),
                    Version::from_base64("Aaaa"),
                    [],
                    Some(doc! {"some": true}),
                ))
                .await
                .unwrap();
        }
        assert!(engine.prefix_exists(b"user:").unwrap().is_some());
        assert!(engine.prefix_exists(b"group:").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let engine = engine(&["peer"]);
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_matches!(
            engine.head(&ItemId::from_str_id("abc")).await,
            Err(MergeTreeError::Closed)
        );
        assert_matches!(
            engine.create_remote_write_stream("peer"),
            Err(MergeTreeError::Closed)
        );
    }

    #[tokio::test]
    async fn test_stats_cover_all_trees() {
        let engine = engine(&["peer"]);
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"some": true})],
        )
        .await;
        engine.auto_merge().await.unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.conflicts, 0);
        let names: Vec<_> = stats.trees.iter().map(|tree| tree.name.as_str()).collect();
        assert_eq!(names, vec![LOCAL_TREE, STAGE_TREE, "peer"]);
        assert_eq!(stats.trees[0].items, 1);
        assert_eq!(stats.trees[2].items, 1);
    }

    #[tokio::test]
    async fn test_delete_versus_modify_conflicts() {
        let engine = engine(&["peer"]);
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Aaaa", &[], doc! {"a": 1})],
        )
        .await;
        engine.auto_merge().await.unwrap();
        let id = ItemId::from_str_id("abc");
        let local_root = engine.head(&id).await.unwrap().unwrap();
        {
            let mut local = engine.create_local_write_stream().unwrap();
            local
                .write(Item::new_tombstone(
                    id.clone(),
                    Version::from_base64("MMMM"),
                    [local_root.header.v.clone()],
                ))
                .await
                .unwrap();
        }
        ingest(
            &engine,
            "peer",
            vec![remote_item("abc", "Cccc", &["Aaaa"], doc! {"a": 2})],
        )
        .await;

        let summary = engine.auto_merge().await.unwrap();
        assert_eq!(summary.conflicts, 1);
        let conflict = engine.get_conflict(1).unwrap().unwrap();
        assert_eq!(conflict.error, "delete versus modify");
    }
}
