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

use std::io::Cursor;

use bson::doc;
use perspectivedb_lib::item::Item;
use perspectivedb_lib::version::ItemId;
use perspectivedb_lib::version::Version;
use perspectivedb_lib::wire::ItemWriter;
use pretty_assertions::assert_eq;
use testutils::all_items;
use testutils::item_with_body;
use testutils::memory_merge_tree;
use testutils::tombstone;

/// An empty node receives two chained items for one id over the remote
/// data channel.
#[tokio::test]
async fn test_two_item_remote_import() {
    let engine = memory_merge_tree(&["someClient"]);

    // The networking layer hands the core a BSON byte stream.
    let mut buf = Cursor::new(vec![]);
    let mut writer = ItemWriter::new(&mut buf);
    writer
        .write_item(&item_with_body("abc", "Aaaa", &[], doc! {"some": true}))
        .await
        .unwrap();
    writer
        .write_item(&item_with_body(
            "abc",
            "Bbbb",
            &["Aaaa"],
            doc! {"some": "other"},
        ))
        .await
        .unwrap();

    let mut stream = engine.create_remote_write_stream("someClient").unwrap();
    let new_items = stream
        .copy_from(Cursor::new(buf.into_inner()))
        .await
        .unwrap();
    assert_eq!(new_items, 2);

    // The perspective tree holds exactly those two items, perspective
    // stamped in, sequences assigned.
    let remote = all_items(engine.remote_tree("someClient").unwrap()).await;
    assert_eq!(remote.len(), 2);
    assert_eq!(remote[0].header.v, Version::from_base64("Aaaa"));
    assert_eq!(remote[0].header.pe.as_deref(), Some("someClient"));
    assert_eq!(remote[0].header.i, Some(1));
    assert_eq!(remote[1].header.v, Version::from_base64("Bbbb"));
    assert_eq!(remote[1].header.i, Some(2));

    // After auto-merge the local tree carries the same chain under fresh
    // versions.
    engine.auto_merge().await.unwrap();
    let local = all_items(engine.local_tree()).await;
    assert_eq!(local.len(), 2);
    assert!(local[0].is_root());
    assert_eq!(local[0].body, Some(doc! {"some": true}));
    assert_eq!(local[1].header.pa.as_slice(), &[local[0].header.v.clone()]);
    assert_eq!(local[1].body, Some(doc! {"some": "other"}));
    for item in &local {
        assert_eq!(item.header.pe, None);
        assert_ne!(item.header.v, Version::from_base64("Aaaa"));
        assert_ne!(item.header.v, Version::from_base64("Bbbb"));
    }
}

/// Delete-versus-delete converges on a tombstone.
#[tokio::test]
async fn test_concurrent_deletes_converge() {
    let engine = memory_merge_tree(&["peer"]);
    {
        let mut remote = engine.create_remote_write_stream("peer").unwrap();
        remote
            .write(item_with_body("abc", "Aaaa", &[], doc! {"a": 1}))
            .await
            .unwrap();
    }
    engine.auto_merge().await.unwrap();

    let id = ItemId::from_str_id("abc");
    let root = engine.head(&id).await.unwrap().unwrap();
    {
        let mut local = engine.create_local_write_stream().unwrap();
        local
            .write(Item::new_tombstone(
                id.clone(),
                Version::from_base64("MMMM"),
                [root.header.v.clone()],
            ))
            .await
            .unwrap();
    }
    {
        let mut remote = engine.create_remote_write_stream("peer").unwrap();
        remote
            .write(tombstone("abc", "Cccc", &["Aaaa"]))
            .await
            .unwrap();
    }

    let summary = engine.auto_merge().await.unwrap();
    assert_eq!(summary.conflicts, 0);
    assert_eq!(summary.merged, 1);

    // Deleted heads do not answer lookups.
    assert_eq!(engine.head(&id).await.unwrap(), None);
    let local = all_items(engine.local_tree()).await;
    let last = local.last().unwrap();
    assert!(last.is_tombstone());
    assert_eq!(last.body, None);
    assert_eq!(last.header.pa.len(), 2);
}

/// Items of distinct ids from two perspectives merge independently.
#[tokio::test]
async fn test_two_perspectives_distinct_ids() {
    let engine = memory_merge_tree(&["alfa", "bravo"]);
    {
        let mut remote = engine.create_remote_write_stream("alfa").unwrap();
        remote
            .write(item_with_body("a-doc", "Aaaa", &[], doc! {"from": "alfa"}))
            .await
            .unwrap();
    }
    {
        let mut remote = engine.create_remote_write_stream("bravo").unwrap();
        remote
            .write(item_with_body("b-doc", "Bbbb", &[], doc! {"from": "bravo"}))
            .await
            .unwrap();
    }

    let summary = engine.auto_merge().await.unwrap();
    assert_eq!(summary.merged, 2);

    let a = engine
        .head(&ItemId::from_str_id("a-doc"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.body, Some(doc! {"from": "alfa"}));
    let b = engine
        .head(&ItemId::from_str_id("b-doc"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.body, Some(doc! {"from": "bravo"}));
}

/// Removing a perspective wipes its tree but leaves the local history.
#[tokio::test]
async fn test_remove_perspective_data() {
    let engine = memory_merge_tree(&["peer"]);
    {
        let mut remote = engine.create_remote_write_stream("peer").unwrap();
        remote
            .write(item_with_body("abc", "Aaaa", &[], doc! {"a": 1}))
            .await
            .unwrap();
    }
    engine.auto_merge().await.unwrap();

    let deleted = engine.remote_tree("peer").unwrap().clear().await.unwrap();
    assert!(deleted > 0);
    assert_eq!(engine.remote_tree("peer").unwrap().stats().unwrap().items, 0);
    assert_eq!(engine.local_tree().stats().unwrap().items, 1);
}
