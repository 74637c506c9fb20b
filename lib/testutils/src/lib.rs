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

use std::sync::Arc;

use bson::Document;
use bson::doc;
use perspectivedb_lib::fjall_store::FjallStore;
use perspectivedb_lib::item::Item;
use perspectivedb_lib::kv::KvStore;
use perspectivedb_lib::memory_store::MemoryStore;
use perspectivedb_lib::merge_tree::MergeTree;
use perspectivedb_lib::merge_tree::MergeTreeOptions;
use perspectivedb_lib::tree::ItemReadStream;
use perspectivedb_lib::tree::ReadPosition;
use perspectivedb_lib::tree::Tree;
use perspectivedb_lib::version::ItemId;
use perspectivedb_lib::version::Version;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("perspectivedb-test-")
        .tempdir()
        .unwrap()
}

/// A merge tree over an in-memory store.
pub fn memory_merge_tree(perspectives: &[&str]) -> MergeTree {
    MergeTree::open(
        Arc::new(MemoryStore::new()),
        MergeTreeOptions {
            version_size: 3,
            perspectives: perspectives.iter().map(|pe| pe.to_string()).collect(),
        },
    )
    .unwrap()
}

/// A merge tree over a persistent store in a temp directory. Keeps the
/// directory alive for the duration of the test.
pub struct TestEngine {
    _temp_dir: TempDir,
    pub merge_tree: MergeTree,
}

impl TestEngine {
    pub fn init(perspectives: &[&str]) -> Self {
        let temp_dir = new_temp_dir();
        let store: Arc<dyn KvStore> =
            Arc::new(FjallStore::open(&temp_dir.path().join("data")).unwrap());
        let merge_tree = MergeTree::open(
            store,
            MergeTreeOptions {
                version_size: 3,
                perspectives: perspectives.iter().map(|pe| pe.to_string()).collect(),
            },
        )
        .unwrap();
        Self {
            _temp_dir: temp_dir,
            merge_tree,
        }
    }
}

pub fn item(id: &str, v: &str, pa: &[&str]) -> Item {
    item_with_body(id, v, pa, doc! {"some": true})
}

pub fn item_with_body(id: &str, v: &str, pa: &[&str], body: Document) -> Item {
    Item::new(
        ItemId::from_str_id(id),
        Version::try_from_base64(v).unwrap(),
        pa.iter().map(|pa| Version::try_from_base64(pa).unwrap()),
        Some(body),
    )
}

pub fn tombstone(id: &str, v: &str, pa: &[&str]) -> Item {
    Item::new_tombstone(
        ItemId::from_str_id(id),
        Version::try_from_base64(v).unwrap(),
        pa.iter().map(|pa| Version::try_from_base64(pa).unwrap()),
    )
}

/// Collects a finite read stream into a vec.
pub async fn collect_items(stream: &mut ItemReadStream<'_>) -> Vec<Item> {
    let mut items = vec![];
    while let Some(item) = stream.try_next().await.unwrap() {
        items.push(item);
    }
    items
}

/// All items of a tree in insertion order.
pub async fn all_items(tree: &Tree) -> Vec<Item> {
    collect_items(&mut tree.read_items(ReadPosition::Beginning, false)).await
}
