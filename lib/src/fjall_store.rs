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

//! Persistent [`KvStore`] over an LSM keyspace.

use std::path::Path;

use fjall::Keyspace;
use fjall::PartitionCreateOptions;
use fjall::PartitionHandle;
use fjall::PersistMode;

use crate::kv::Batch;
use crate::kv::KvEntry;
use crate::kv::KvError;
use crate::kv::KvIter;
use crate::kv::KvResult;
use crate::kv::KvStore;

/// Name of the single data partition inside the keyspace.
const DATA_PARTITION: &str = "data";

/// One fjall keyspace with a single data partition. All trees of one db
/// share it; the tree name is part of every key.
pub struct FjallStore {
    keyspace: Keyspace,
    data: PartitionHandle,
}

impl std::fmt::Debug for FjallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallStore").finish_non_exhaustive()
    }
}

impl FjallStore {
    /// Opens (creating if needed) the store under `path`, typically
    /// `<dbroot>/<name>/data`.
    pub fn open(path: &Path) -> KvResult<Self> {
        let keyspace = fjall::Config::new(path).open().map_err(KvError::io)?;
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .map_err(KvError::io)?;
        Ok(Self { keyspace, data })
    }
}

impl KvStore for FjallStore {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let value = self.data.get(key).map_err(KvError::io)?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    fn contains(&self, key: &[u8]) -> KvResult<bool> {
        self.data.contains_key(key).map_err(KvError::io)
    }

    fn write(&self, batch: Batch) -> KvResult<()> {
        let mut inner = self.keyspace.batch();
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => inner.insert(&self.data, key, value),
                None => inner.remove(&self.data, key),
            }
        }
        inner.commit().map_err(KvError::io)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> KvIter<'_> {
        let entries: Vec<_> = self
            .data
            .prefix(prefix.to_vec())
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(KvError::io)
            })
            .collect();
        Box::new(entries.into_iter())
    }

    fn scan_from(&self, start: &[u8]) -> KvIter<'_> {
        let entries: Vec<_> = self
            .data
            .range(start.to_vec()..)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(KvError::io)
            })
            .collect();
        Box::new(entries.into_iter())
    }

    fn last_in_prefix(&self, prefix: &[u8]) -> KvResult<Option<KvEntry>> {
        match self.data.prefix(prefix.to_vec()).next_back() {
            Some(entry) => {
                let (key, value) = entry.map_err(KvError::io)?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    fn persist(&self) -> KvResult<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(KvError::io)
    }
}
