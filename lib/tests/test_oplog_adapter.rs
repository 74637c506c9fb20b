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
use perspectivedb_lib::merge_tree::MergeTree;
use perspectivedb_lib::oplog::ChannelHeadLookup;
use perspectivedb_lib::oplog::OplogEntry;
use perspectivedb_lib::oplog::OplogEvent;
use perspectivedb_lib::oplog::OplogTransformer;
use perspectivedb_lib::version::ItemId;
use perspectivedb_lib::wire::HeadLookupRequest;
use perspectivedb_lib::wire::ItemWriter;
use perspectivedb_lib::wire::MAX_LOOKUP_REQUEST_SIZE;
use perspectivedb_lib::wire::read_json_line;
use pretty_assertions::assert_eq;
use testutils::all_items;
use testutils::memory_merge_tree;
use tokio::io::BufReader;

/// Serves head lookups over the channel pair until the request stream
/// closes: LDJSON in, one BSON document out (empty means unknown).
async fn serve_head_lookups<R, W>(engine: Arc<MergeTree>, reader: R, writer: W)
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(reader);
    let mut writer = ItemWriter::new(writer);
    while let Some(request) = read_json_line::<HeadLookupRequest, _>(
        &mut reader,
        MAX_LOOKUP_REQUEST_SIZE,
    )
    .await
    .unwrap()
    {
        let response = match &request.id {
            Some(id) => engine.head(&ItemId::from_str_id(id)).await.unwrap(),
            None => match &request.prefix_exists {
                Some(prefix) => engine.prefix_exists(prefix.as_bytes()).unwrap(),
                None => None,
            },
        };
        match response {
            Some(item) => {
                let doc = bson::to_document(&item).unwrap();
                writer.write_document(&doc).await.unwrap();
            }
            None => writer.write_document(&Document::new()).await.unwrap(),
        }
        writer.flush().await.unwrap();
    }
}

#[tokio::test]
async fn test_oplog_chain_through_lookup_channel() {
    let engine = Arc::new(memory_merge_tree(&[]));

    let (adapter_side, core_side) = tokio::io::duplex(64 * 1024);
    let (core_read, core_write) = tokio::io::split(core_side);
    let server = tokio::spawn(serve_head_lookups(engine.clone(), core_read, core_write));

    let (adapter_read, adapter_write) = tokio::io::split(adapter_side);
    let transformer = OplogTransformer::new(ChannelHeadLookup::new(adapter_read, adapter_write), 3);

    let entries = vec![
        OplogEntry {
            ts: Some(bson::Timestamp {
                time: 1700000000,
                increment: 1,
            }),
            op: OplogEvent::Insert {
                id: ItemId::from_str_id("abc"),
                document: doc! {"a": 1, "b": {"c": 2}},
            },
        },
        OplogEntry {
            ts: Some(bson::Timestamp {
                time: 1700000000,
                increment: 2,
            }),
            op: OplogEvent::UpdateModifier {
                id: ItemId::from_str_id("abc"),
                modifier: doc! {"$set": {"b.c": 3}},
            },
        },
        OplogEntry {
            ts: None,
            op: OplogEvent::UpdateFull {
                id: ItemId::from_str_id("abc"),
                document: doc! {"a": 1, "b": {"c": 4}},
            },
        },
        OplogEntry {
            ts: None,
            op: OplogEvent::Delete {
                id: ItemId::from_str_id("abc"),
            },
        },
    ];

    // The adapter transforms one record at a time and writes the result
    // through the local write stream before looking at the next record.
    for entry in &entries {
        let item = transformer.transform(entry).await.unwrap();
        let mut local = engine.create_local_write_stream().unwrap();
        local.write(item).await.unwrap();
    }
    drop(transformer);
    server.await.unwrap();

    let history = all_items(engine.local_tree()).await;
    assert_eq!(history.len(), 4);
    assert!(history[0].is_root());
    assert_eq!(history[0].body, Some(doc! {"a": 1, "b": {"c": 2}}));
    // The modifier was materialized against the insert.
    assert_eq!(history[1].body, Some(doc! {"a": 1, "b": {"c": 3}}));
    assert_eq!(
        history[1].meta,
        Some(doc! {"ts": bson::Bson::Timestamp(bson::Timestamp {
            time: 1700000000,
            increment: 2,
        })})
    );
    assert_eq!(history[2].body, Some(doc! {"a": 1, "b": {"c": 4}}));
    assert!(history[3].is_tombstone());

    // Each item chains onto its predecessor.
    for window in history.windows(2) {
        assert_eq!(
            window[1].header.pa.as_slice(),
            &[window[0].header.v.clone()]
        );
    }

    // Post-delete there is no head to answer with.
    assert_eq!(
        engine.head(&ItemId::from_str_id("abc")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_prefix_exists_over_channel() {
    let engine = Arc::new(memory_merge_tree(&[]));
    {
        let mut local = engine.create_local_write_stream().unwrap();
        local
            .write(testutils::item_with_body(
                "user:1",
                "Aaaa",
                &[],
                doc! {"some": true},
            ))
            .await
            .unwrap();
    }

    let (adapter_side, core_side) = tokio::io::duplex(64 * 1024);
    let (core_read, core_write) = tokio::io::split(core_side);
    let server = tokio::spawn(serve_head_lookups(engine.clone(), core_read, core_write));

    let (adapter_read, adapter_write) = tokio::io::split(adapter_side);
    let mut reader = perspectivedb_lib::wire::ItemReader::new(adapter_read);
    let mut writer = adapter_write;
    perspectivedb_lib::wire::write_json_line(
        &mut writer,
        &HeadLookupRequest {
            id: None,
            prefix_exists: Some("user:".to_string()),
        },
    )
    .await
    .unwrap();
    let response = reader.read_document().await.unwrap().unwrap();
    assert!(!response.is_empty());

    perspectivedb_lib::wire::write_json_line(
        &mut writer,
        &HeadLookupRequest {
            id: None,
            prefix_exists: Some("group:".to_string()),
        },
    )
    .await
    .unwrap();
    let response = reader.read_document().await.unwrap().unwrap();
    assert!(response.is_empty());

    drop(writer);
    drop(reader);
    server.await.unwrap();
}
