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

//! Version identifiers and logical item ids.
//!
//! A [`Version`] is an opaque random identifier, unique within a tree with
//! overwhelming probability. It is base64-encoded on the wire (the default
//! 3-byte size encodes as 4 characters). An [`ItemId`] is the opaque logical
//! identifier shared by all versions of one document.

use std::fmt;
use std::fmt::Debug;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::Rng as _;

/// Default number of random bytes in a freshly allocated version.
pub const DEFAULT_VERSION_SIZE: usize = 3;

/// Opaque version identifier.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Version(Vec<u8>);

impl Version {
    pub fn new(value: Vec<u8>) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parses the given base64 string into a `Version`.
    ///
    /// The given string must be valid. A static str is required to prevent
    /// API misuse.
    pub fn from_base64(encoded: &'static str) -> Self {
        Self::try_from_base64(encoded).unwrap()
    }

    /// Parses the given base64 string into a `Version`.
    pub fn try_from_base64(encoded: impl AsRef<[u8]>) -> Option<Self> {
        // Accept both padded and unpadded forms; the wire always carries the
        // unpadded one.
        let trimmed = strip_padding(encoded.as_ref());
        STANDARD_NO_PAD.decode(trimmed).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the unpadded base64 representation used on the wire.
    pub fn base64(&self) -> String {
        STANDARD_NO_PAD.encode(&self.0)
    }
}

fn strip_padding(encoded: &[u8]) -> &[u8] {
    let end = encoded
        .iter()
        .rposition(|&b| b != b'=')
        .map_or(0, |pos| pos + 1);
    &encoded[..end]
}

impl Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("Version").field(&self.base64()).finish()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.base64())
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.base64())
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct VersionVisitor;

        impl serde::de::Visitor<'_> for VersionVisitor {
            type Value = Version;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64-encoded version string")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Version::try_from_base64(value)
                    .ok_or_else(|| E::custom(format!("invalid version {value:?}")))
            }
        }

        deserializer.deserialize_str(VersionVisitor)
    }
}

/// Opaque logical identifier of a document.
///
/// All versions of one document share the same id. The id is a byte string
/// chosen by the writer; it has no structure the engine cares about beyond a
/// length limit.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ItemId(Vec<u8>);

impl ItemId {
    pub fn new(value: Vec<u8>) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn from_str_id(id: &str) -> Self {
        Self(id.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The id as UTF-8 when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("ItemId").field(&self.to_string()).finish()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.as_str() {
            Some(s) => f.pad(s),
            None => f.pad(&encode_hex(&self.0)),
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

impl serde::Serialize for ItemId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.as_str() {
            Some(s) => serializer.serialize_str(s),
            None => serializer.serialize_bytes(&self.0),
        }
    }
}

impl<'de> serde::Deserialize<'de> for ItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ItemIdVisitor;

        impl serde::de::Visitor<'_> for ItemIdVisitor {
            type Value = ItemId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or byte string")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(ItemId::from_str_id(value))
            }

            fn visit_bytes<E: serde::de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
                Ok(ItemId::from_bytes(value))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, value: Vec<u8>) -> Result<Self::Value, E> {
                Ok(ItemId::new(value))
            }
        }

        deserializer.deserialize_any(ItemIdVisitor)
    }
}

/// Draws fresh random versions of a fixed size.
///
/// Collision probability follows the birthday bound; at the default 3-byte
/// size the space is 24 bits, so a single id accumulating ~2^12 versions has
/// even odds of a collision. Callers re-check against the target tree and
/// retry.
#[derive(Clone, Debug)]
pub struct VersionAllocator {
    size: usize,
}

impl VersionAllocator {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "version size must be positive");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Draws one random version. The caller is responsible for uniqueness
    /// checks against the tree it writes into.
    pub fn fresh(&self) -> Version {
        let mut bytes = vec![0; self.size];
        rand::rng().fill(&mut bytes[..]);
        Version::new(bytes)
    }

    /// Draws versions until `taken` reports one unused.
    pub fn fresh_where<E>(
        &self,
        mut taken: impl FnMut(&Version) -> Result<bool, E>,
    ) -> Result<Version, E> {
        loop {
            let v = self.fresh();
            if !taken(&v)? {
                return Ok(v);
            }
        }
    }
}
