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

//! Core of PerspectiveDB, a multi-master replicated document store.
//!
//! Each *perspective* (a named peer or the local writer) keeps its own
//! content-addressed version history in a [`tree::Tree`]; the
//! [`merge_tree::MergeTree`] lifts remote histories into the single local
//! history through streaming three-way merges, quarantining conflicting
//! merges in the [`conflicts::ConflictStore`]. Transports, process
//! supervision and config parsing live outside; they reach the core through
//! the codecs in [`wire`].

#![deny(unused_must_use)]

pub mod config;
pub mod conflicts;
pub mod fjall_store;
pub mod item;
pub mod kv;
#[cfg(any(test, feature = "testing"))]
pub mod memory_store;
pub mod merge;
pub mod merge_tree;
pub mod oplog;
pub mod tree;
pub mod version;
pub mod wire;
