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

//! Adapter contract for a foreign change log (a MongoDB oplog).
//!
//! The adapter observes insert/update/delete records and synthesizes
//! canonical items chained onto the last known local head. Update modifiers
//! need the pre-state; the adapter fetches it through a
//! [`HeadLookupService`], either in-process or over the LDJSON-request /
//! BSON-response channel pair. The transform never mutates its inputs.

use async_trait::async_trait;
use bson::Bson;
use bson::Document;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use crate::item::Item;
use crate::merge_tree::MergeTree;
use crate::version::ItemId;
use crate::version::VersionAllocator;
use crate::wire::HeadLookupRequest;
use crate::wire::ItemReader;
use crate::wire::WireError;
use crate::wire::write_json_line;

pub type OplogResult<T> = Result<T, OplogError>;

#[derive(Debug, Error)]
pub enum OplogError {
    #[error("no known head for {id}")]
    PreviousVersionNotFound { id: ItemId },
    #[error("unsupported update operator {op:?}")]
    UnsupportedOperator { op: String },
    #[error("malformed modifier: {reason}")]
    MalformedModifier { reason: String },
    #[error("head lookup failed: {reason}")]
    Lookup { reason: String },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Answers "what is the last known local state of this id".
#[async_trait]
pub trait HeadLookupService: Send + Sync {
    async fn head(&self, id: &ItemId) -> OplogResult<Option<Item>>;
}

#[async_trait]
impl HeadLookupService for MergeTree {
    async fn head(&self, id: &ItemId) -> OplogResult<Option<Item>> {
        Self::head(self, id).await.map_err(|err| OplogError::Lookup {
            reason: err.to_string(),
        })
    }
}

/// A lookup client speaking the channel pair: one LDJSON request out, one
/// BSON document back (empty means unknown). Requests are serialized so
/// responses cannot interleave.
pub struct ChannelHeadLookup<R, W> {
    channel: Mutex<(ItemReader<R>, W)>,
}

impl<R, W> ChannelHeadLookup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            channel: Mutex::new((ItemReader::new(reader), writer)),
        }
    }
}

#[async_trait]
impl<R, W> HeadLookupService for ChannelHeadLookup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn head(&self, id: &ItemId) -> OplogResult<Option<Item>> {
        let id_str = id.as_str().ok_or_else(|| OplogError::Lookup {
            reason: format!("id {id} is not representable on the lookup channel"),
        })?;
        let request = HeadLookupRequest {
            id: Some(id_str.to_string()),
            prefix_exists: None,
        };
        let mut channel = self.channel.lock().await;
        let (reader, writer) = &mut *channel;
        write_json_line(writer, &request).await?;
        writer.flush().await.map_err(|err| OplogError::Lookup {
            reason: err.to_string(),
        })?;
        match reader.read_document().await? {
            None => Err(OplogError::Lookup {
                reason: "lookup channel closed".to_string(),
            }),
            Some(doc) if doc.is_empty() => Ok(None),
            Some(doc) => Ok(Some(bson::from_document(doc).map_err(WireError::from)?)),
        }
    }
}

/// One observed oplog record.
#[derive(Clone, Debug, PartialEq)]
pub struct OplogEntry {
    /// Source timestamp, kept as adapter-private metadata on the item.
    pub ts: Option<bson::Timestamp>,
    pub op: OplogEvent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OplogEvent {
    Insert { id: ItemId, document: Document },
    /// An update carrying the full post-state.
    UpdateFull { id: ItemId, document: Document },
    /// An update carrying only `$set`/`$unset` operators (or a replacement
    /// document); the pre-state comes from the lookup service.
    UpdateModifier { id: ItemId, modifier: Document },
    Delete { id: ItemId },
}

impl OplogEvent {
    pub fn id(&self) -> &ItemId {
        match self {
            Self::Insert { id, .. }
            | Self::UpdateFull { id, .. }
            | Self::UpdateModifier { id, .. }
            | Self::Delete { id } => id,
        }
    }
}

/// Turns oplog records into canonical items.
pub struct OplogTransformer<S> {
    lookup: S,
    allocator: VersionAllocator,
}

impl<S: HeadLookupService> OplogTransformer<S> {
    pub fn new(lookup: S, version_size: usize) -> Self {
        Self {
            lookup,
            allocator: VersionAllocator::new(version_size),
        }
    }

    pub fn lookup(&self) -> &S {
        &self.lookup
    }

    /// Synthesizes the item for one record. The item chains onto the
    /// current head of the id; the engine validates the chain on write.
    pub async fn transform(&self, entry: &OplogEntry) -> OplogResult<Item> {
        let id = entry.op.id().clone();
        let head = self.lookup.head(&id).await?;
        let parents = head.iter().map(|head| head.header.v.clone());

        let mut item = match &entry.op {
            OplogEvent::Insert { document, .. } | OplogEvent::UpdateFull { document, .. } => {
                Item::new(
                    id,
                    self.allocator.fresh(),
                    parents,
                    Some(document.clone()),
                )
            }
            OplogEvent::UpdateModifier { modifier, .. } => {
                let head = head
                    .as_ref()
                    .ok_or(OplogError::PreviousVersionNotFound { id: id.clone() })?;
                let base = head.body.clone().unwrap_or_default();
                let materialized = apply_modifier(&base, modifier)?;
                Item::new(
                    id,
                    self.allocator.fresh(),
                    parents,
                    Some(materialized),
                )
            }
            OplogEvent::Delete { .. } => {
                if head.is_none() {
                    return Err(OplogError::PreviousVersionNotFound { id });
                }
                Item::new_tombstone(id, self.allocator.fresh(), parents)
            }
        };

        if let Some(ts) = entry.ts {
            let mut meta = Document::new();
            meta.insert("ts", Bson::Timestamp(ts));
            item.meta = Some(meta);
        }
        Ok(item)
    }
}

/// Applies a MongoDB-style update document to `base`. A document without
/// `$`-operators replaces the whole body.
fn apply_modifier(base: &Document, modifier: &Document) -> OplogResult<Document> {
    if !modifier.keys().any(|key| key.starts_with('$')) {
        return Ok(modifier.clone());
    }
    let mut document = base.clone();
    for (op, arg) in modifier {
        let arg = arg
            .as_document()
            .ok_or_else(|| OplogError::MalformedModifier {
                reason: format!("{op} argument is not a document"),
            })?;
        match op.as_str() {
            "$set" => {
                for (path, value) in arg {
                    set_path(&mut document, path, value.clone())?;
                }
            }
            "$unset" => {
                for (path, _) in arg {
                    unset_path(&mut document, path);
                }
            }
            other => {
                return Err(OplogError::UnsupportedOperator {
                    op: other.to_string(),
                });
            }
        }
    }
    Ok(document)
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> OplogResult<()> {
    let mut parts = path.split('.').peekable();
    let mut current = document;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part, value);
            return Ok(());
        }
        if !current.contains_key(part) {
            current.insert(part, Document::new());
        }
        current = match current.get_mut(part) {
            Some(Bson::Document(doc)) => doc,
            _ => {
                return Err(OplogError::MalformedModifier {
                    reason: format!("path {path} crosses a non-document value"),
                });
            }
        };
    }
    unreachable!("split always yields at least one part");
}

fn unset_path(document: &mut Document, path: &str) {
    let mut parts = path.split('.').peekable();
    let mut current = document;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.remove(part);
            return;
        }
        match current.get_mut(part) {
            Some(Bson::Document(doc)) => current = doc,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use bson::doc;
    use pollster::FutureExt as _;

    use super::*;
    use crate::version::Version;

    struct FixedHeads {
        heads: HashMap<ItemId, Item>,
    }

    #[async_trait]
    impl HeadLookupService for FixedHeads {
        async fn head(&self, id: &ItemId) -> OplogResult<Option<Item>> {
            Ok(self.heads.get(id).cloned())
        }
    }

    fn transformer_with_head(id: &str, body: Document) -> OplogTransformer<FixedHeads> {
        let id = ItemId::from_str_id(id);
        let head = Item::new(
            id.clone(),
            Version::from_base64("Aaaa"),
            [],
            Some(body),
        );
        OplogTransformer::new(
            FixedHeads {
                heads: HashMap::from([(id, head)]),
            },
            3,
        )
    }

    fn empty_transformer() -> OplogTransformer<FixedHeads> {
        OplogTransformer::new(
            FixedHeads {
                heads: HashMap::new(),
            },
            3,
        )
    }

    fn entry(op: OplogEvent) -> OplogEntry {
        OplogEntry { ts: None, op }
    }

    #[test]
    fn test_insert_without_head_is_a_root() {
        let transformer = empty_transformer();
        let item = transformer
            .transform(&entry(OplogEvent::Insert {
                id: ItemId::from_str_id("abc"),
                document: doc! {"some": true},
            }))
            .block_on()
            .unwrap();
        assert!(item.is_root());
        assert_eq!(item.body, Some(doc! {"some": true}));
        assert_eq!(item.header.v.len(), 3);
    }

    #[test]
    fn test_update_full_chains_onto_head() {
        let transformer = transformer_with_head("abc", doc! {"some": true});
        let item = transformer
            .transform(&entry(OplogEvent::UpdateFull {
                id: ItemId::from_str_id("abc"),
                document: doc! {"some": "other"},
            }))
            .block_on()
            .unwrap();
        assert_eq!(
            item.header.pa.as_slice(),
            &[Version::from_base64("Aaaa")]
        );
        assert_eq!(item.body, Some(doc! {"some": "other"}));
    }

    #[test]
    fn test_modifier_materializes_pre_state() {
        let transformer = transformer_with_head("abc", doc! {"a": 1, "b": {"c": 2}});
        let item = transformer
            .transform(&entry(OplogEvent::UpdateModifier {
                id: ItemId::from_str_id("abc"),
                modifier: doc! {"$set": {"b.c": 3, "d": 4}, "$unset": {"a": 1}},
            }))
            .block_on()
            .unwrap();
        assert_eq!(item.body, Some(doc! {"b": {"c": 3}, "d": 4}));
    }

    #[test]
    fn test_modifier_without_operators_replaces_body() {
        let transformer = transformer_with_head("abc", doc! {"a": 1});
        let item = transformer
            .transform(&entry(OplogEvent::UpdateModifier {
                id: ItemId::from_str_id("abc"),
                modifier: doc! {"fresh": true},
            }))
            .block_on()
            .unwrap();
        assert_eq!(item.body, Some(doc! {"fresh": true}));
    }

    #[test]
    fn test_modifier_without_base_fails() {
        let transformer = empty_transformer();
        assert_matches!(
            transformer
                .transform(&entry(OplogEvent::UpdateModifier {
                    id: ItemId::from_str_id("abc"),
                    modifier: doc! {"$set": {"a": 1}},
                }))
                .block_on(),
            Err(OplogError::PreviousVersionNotFound { .. })
        );
    }

    #[test]
    fn test_unsupported_operator() {
        let transformer = transformer_with_head("abc", doc! {"a": 1});
        assert_matches!(
            transformer
                .transform(&entry(OplogEvent::UpdateModifier {
                    id: ItemId::from_str_id("abc"),
                    modifier: doc! {"$inc": {"a": 1}},
                }))
                .block_on(),
            Err(OplogError::UnsupportedOperator { .. })
        );
    }

    #[test]
    fn test_delete_yields_tombstone() {
        let transformer = transformer_with_head("abc", doc! {"a": 1});
        let item = transformer
            .transform(&entry(OplogEvent::Delete {
                id: ItemId::from_str_id("abc"),
            }))
            .block_on()
            .unwrap();
        assert!(item.is_tombstone());
        assert_eq!(item.body, None);

        let transformer = empty_transformer();
        assert_matches!(
            transformer
                .transform(&entry(OplogEvent::Delete {
                    id: ItemId::from_str_id("abc"),
                }))
                .block_on(),
            Err(OplogError::PreviousVersionNotFound { .. })
        );
    }

    #[test]
    fn test_source_timestamp_lands_in_meta() {
        let transformer = empty_transformer();
        let ts = bson::Timestamp {
            time: 1700000000,
            increment: 7,
        };
        let item = transformer
            .transform(&OplogEntry {
                ts: Some(ts),
                op: OplogEvent::Insert {
                    id: ItemId::from_str_id("abc"),
                    document: doc! {},
                },
            })
            .block_on()
            .unwrap();
        assert_eq!(
            item.meta,
            Some(doc! {"ts": Bson::Timestamp(ts)})
        );
    }

    #[test]
    fn test_transform_does_not_mutate_input() {
        let transformer = transformer_with_head("abc", doc! {"a": 1});
        let modifier = doc! {"$set": {"a": 2}};
        let event = entry(OplogEvent::UpdateModifier {
            id: ItemId::from_str_id("abc"),
            modifier: modifier.clone(),
        });
        transformer.transform(&event).block_on().unwrap();
        assert_eq!(
            event.op,
            OplogEvent::UpdateModifier {
                id: ItemId::from_str_id("abc"),
                modifier,
            }
        );
    }
}
