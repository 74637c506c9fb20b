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

//! Typed configuration.
//!
//! The supervisor parses the HJSON file and hands each db child its slice
//! of it; the core only defines the deserializable shape and the checks
//! that must hold before an engine opens.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::merge_tree::MergeTreeOptions;
use crate::version::DEFAULT_VERSION_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("perspective {name:?} configured twice")]
    DuplicatePerspective { name: String },
    #[error("perspective name must not be empty")]
    EmptyPerspective,
}

/// Top-level configuration object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbroot: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wss: Option<WssConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub dbs: Vec<DbConfig>,
}

impl Config {
    pub fn db(&self, name: &str) -> Option<&DbConfig> {
        self.dbs.iter().find(|db| db.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub console: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console: false,
            level: default_log_level(),
            file: None,
            error: None,
        }
    }
}

fn default_log_level() -> String {
    "notice".to_string()
}

/// WebSocket server settings, used by the transport collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WssConfig {
    pub key: String,
    pub cert: String,
    pub dhparam: String,
    #[serde(default = "default_wss_host")]
    pub host: String,
    #[serde(default = "default_wss_port")]
    pub port: u16,
}

fn default_wss_host() -> String {
    "127.0.0.1".to_string()
}

fn default_wss_port() -> u16 {
    3344
}

/// One outbound SSH tunnel, used by the transport collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// One replicated database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,
    #[serde(rename = "mergeTree", default)]
    pub merge_tree: MergeTreeSettings,
    #[serde(default)]
    pub perspectives: Vec<PerspectiveConfig>,
}

impl DbConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user: None,
            group: None,
            chroot: None,
            merge_tree: MergeTreeSettings::default(),
            perspectives: vec![],
        }
    }

    /// Store directory for this db: `<dbroot>/<name>/data`.
    pub fn store_path(&self, dbroot: &Path) -> PathBuf {
        dbroot.join(&self.name).join("data")
    }

    /// Engine options, after checking the perspective list for obvious
    /// mistakes. Reserved names are rejected when the engine opens.
    pub fn merge_tree_options(&self) -> Result<MergeTreeOptions, ConfigError> {
        let mut names = vec![];
        for perspective in &self.perspectives {
            if perspective.name.is_empty() {
                return Err(ConfigError::EmptyPerspective);
            }
            if names.contains(&perspective.name) {
                return Err(ConfigError::DuplicatePerspective {
                    name: perspective.name.clone(),
                });
            }
            names.push(perspective.name.clone());
        }
        Ok(MergeTreeOptions {
            version_size: self.merge_tree.v_size,
            perspectives: names,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTreeSettings {
    #[serde(rename = "vSize", default = "default_v_size")]
    pub v_size: usize,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            v_size: default_v_size(),
        }
    }
}

fn default_v_size() -> usize {
    DEFAULT_VERSION_SIZE
}

/// One replication peer of a db.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveConfig {
    pub name: String,
    /// Password database for inbound connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passdb: Option<String>,
    /// Secrets file for outbound connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<String>,
    #[serde(default)]
    pub import: ReplicationPolicy,
    #[serde(default)]
    pub export: ReplicationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl PerspectiveConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passdb: None,
            secrets: None,
            import: ReplicationPolicy::default(),
            export: ReplicationPolicy::default(),
            username: None,
            database: None,
            port: None,
        }
    }
}

/// Whether (and how) items flow in one direction. The object form carries
/// the filter shape; enforcement lives at the stream boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplicationPolicy {
    Enabled(bool),
    Filtered(ReplicationFilter),
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

impl ReplicationPolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Enabled(false))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    /// Resume offset, a base64 version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<String>,
}
