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

//! Channel codecs the networking collaborator speaks with the core.
//!
//! Control records are line-delimited JSON; item streams are raw BSON
//! documents back to back. The core never sees sockets, only readers and
//! writers handed across these codecs.

use std::fmt;
use std::fmt::Debug;

use bson::Document;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt as _;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::config::DbConfig;
use crate::item::Item;
use crate::version::Version;

/// Upper bound on one BSON document on the wire.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on one head-lookup request line.
pub const MAX_LOOKUP_REQUEST_SIZE: usize = 512;

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid BSON document")]
    Decode(#[from] bson::de::Error),
    #[error("unencodable BSON document")]
    Encode(#[from] bson::ser::Error),
    #[error("invalid JSON record")]
    Json(#[from] serde_json::Error),
    #[error("document of {len} bytes exceeds the {max} byte limit")]
    OversizedDocument { len: usize, max: usize },
    #[error("request line exceeds {max} bytes")]
    OversizedRequest { max: usize },
    #[error("nonsensical document length {len}")]
    InvalidDocumentLength { len: i32 },
    #[error("stream ended inside a document")]
    TruncatedDocument,
}

/// First record on an incoming connection; verified by the networking layer
/// against the passdb before any data flows.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub db: String,
}

impl Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db", &self.db)
            .finish()
    }
}

/// Whether a peer wants data, and from which version on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartFrom {
    /// Resume just after this version (exclusive).
    Offset(Version),
    /// `true`: send everything; `false`: send nothing.
    Send(bool),
}

/// Second record on a connection, answered in kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub start: StartFrom,
}

/// One request on the head-lookup channel. Exactly one field is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadLookupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "prefixExists",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prefix_exists: Option<String>,
}

/// Parent-to-child control messages. The supervisor owns the process
/// lifecycle; the core only needs the tagged shape and exhaustive
/// dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    Init {
        db: DbConfig,
    },
    Listen,
    HeadLookup,
    LocalDataChannel,
    #[serde(rename_all = "camelCase")]
    RemoteDataChannel {
        perspective: String,
        #[serde(default)]
        receive_before_send: bool,
    },
    AutoMerge,
    Kill,
}

/// Reads one JSON record from a line-delimited stream. Blank lines are
/// skipped; `None` means end of stream.
pub async fn read_json_line<T, R>(reader: &mut R, max_size: usize) -> WireResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = vec![];
        let mut limited = (&mut *reader).take(max_size as u64 + 1);
        limited.read_until(b'\n', &mut line).await?;
        if line.is_empty() {
            return Ok(None);
        }
        if line.len() > max_size {
            return Err(WireError::OversizedRequest { max: max_size });
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_slice(&line)?));
    }
}

/// Writes one JSON record followed by a newline and flushes.
pub async fn write_json_line<T, W>(writer: &mut W, value: &T) -> WireResult<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Decodes back-to-back BSON documents from a byte stream.
#[derive(Debug)]
pub struct ItemReader<R> {
    reader: R,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> ItemReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_size: MAX_DOCUMENT_SIZE,
        }
    }

    pub fn with_max_size(reader: R, max_size: usize) -> Self {
        Self { reader, max_size }
    }

    /// The next canonical item, or `None` at a clean end of stream.
    pub async fn read_item(&mut self) -> WireResult<Option<Item>> {
        match self.read_raw().await? {
            Some(bytes) => Ok(Some(bson::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The next document, or `None` at a clean end of stream. Used on
    /// channels where an empty document means "nothing".
    pub async fn read_document(&mut self) -> WireResult<Option<Document>> {
        match self.read_raw().await? {
            Some(bytes) => Ok(Some(bson::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_raw(&mut self) -> WireResult<Option<Vec<u8>>> {
        // A BSON document starts with its total length, little endian,
        // including the length field itself.
        let mut first = [0; 1];
        if self.reader.read(&mut first).await? == 0 {
            return Ok(None);
        }
        let mut rest = [0; 3];
        self.reader
            .read_exact(&mut rest)
            .await
            .map_err(eof_means_truncated)?;
        let len = i32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]);
        if len < 5 {
            return Err(WireError::InvalidDocumentLength { len });
        }
        let len = len as usize;
        if len > self.max_size {
            return Err(WireError::OversizedDocument {
                len,
                max: self.max_size,
            });
        }
        let mut buf = vec![0; len];
        buf[..4].copy_from_slice(&(len as i32).to_le_bytes());
        self.reader
            .read_exact(&mut buf[4..])
            .await
            .map_err(eof_means_truncated)?;
        Ok(Some(buf))
    }
}

fn eof_means_truncated(err: std::io::Error) -> WireError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::TruncatedDocument
    } else {
        WireError::Io(err)
    }
}

/// Encodes items as back-to-back BSON documents.
#[derive(Debug)]
pub struct ItemWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> ItemWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_item(&mut self, item: &Item) -> WireResult<()> {
        let bytes = bson::to_vec(item)?;
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn write_document(&mut self, document: &Document) -> WireResult<()> {
        let bytes = bson::to_vec(document)?;
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> WireResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
