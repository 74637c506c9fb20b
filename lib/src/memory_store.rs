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

//! In-memory [`KvStore`] used by tests and tools that don't need durability.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::kv::Batch;
use crate::kv::KvEntry;
use crate::kv::KvIter;
use crate::kv::KvResult;
use crate::kv::KvStore;

/// A `BTreeMap` behind a lock. Scans snapshot the matching range, so an
/// iterator stays valid across writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn write(&self, batch: Batch) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => {
                    inner.insert(key, value);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> KvIter<'_> {
        let inner = self.inner.lock().unwrap();
        let entries: Vec<KvEntry> = inner
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Box::new(entries.into_iter().map(Ok))
    }

    fn scan_from(&self, start: &[u8]) -> KvIter<'_> {
        let inner = self.inner.lock().unwrap();
        let entries: Vec<KvEntry> = inner
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Box::new(entries.into_iter().map(Ok))
    }

    fn last_in_prefix(&self, prefix: &[u8]) -> KvResult<Option<KvEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .filter(|(key, _)| key.starts_with(prefix))
            .next_back()
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    fn persist(&self) -> KvResult<()> {
        Ok(())
    }
}
