// Copyright 2024 TideKV Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Node;

/// Replication ingress listens on `local_port + PORT_SHIFT_SYNC`.
pub const PORT_SHIFT_SYNC: u16 = 100;
/// Snapshot (file transfer) ingress listens on `local_port + PORT_SHIFT_RSYNC`.
pub const PORT_SHIFT_RSYNC: u16 = 200;
/// Data nodes reach the meta command channel on `meta_port + META_PORT_SHIFT_CMD`.
pub const META_PORT_SHIFT_CMD: u16 = 100;

/// Configuration of one data node. Unrecognized fields are rejected so a
/// typo in the config file fails startup instead of being ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Address this node announces to meta and peers.
    #[serde(default = "default::local_ip")]
    pub local_ip: String,

    /// Client port. Replication and snapshot ingress are derived from it.
    #[serde(default = "default::local_port")]
    pub local_port: u16,

    /// Meta quorum addresses, `ip:port` each.
    #[serde(default)]
    pub meta_addr: Vec<String>,

    /// Client request workers.
    #[serde(default = "default::worker_num")]
    pub worker_num: usize,

    /// Workers applying the incoming replication stream; frames are sharded
    /// to them by `partition_id % binlog_receive_worker_num`.
    #[serde(default = "default::binlog_receive_worker_num")]
    pub binlog_receive_worker_num: usize,

    /// Workers draining binlog send tasks.
    #[serde(default = "default::binlog_send_worker_num")]
    pub binlog_send_worker_num: usize,

    /// KV store files, laid out `data_path/<table>/<partition>/`.
    #[serde(default = "default::data_path")]
    pub data_path: PathBuf,

    /// Binlog segments, laid out `log_path/<table>/<partition>/`.
    #[serde(default = "default::log_path")]
    pub log_path: PathBuf,

    /// Staging area for incoming snapshots.
    #[serde(default = "default::db_sync_path")]
    pub db_sync_path: PathBuf,

    /// Maximum size of one binlog segment before rollover, in bytes.
    #[serde(default = "default::binlog_file_size")]
    pub binlog_file_size: u64,

    /// Segments newer than this many files are never purged, regardless of
    /// follower cursors.
    #[serde(default = "default::binlog_retain_segments")]
    pub binlog_retain_segments: u32,

    /// Records a sender drains from one task before yielding to others.
    #[serde(default = "default::sync_batch_size")]
    pub sync_batch_size: usize,

    #[serde(default = "default::ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default::trysync_interval_ms")]
    pub trysync_interval_ms: u64,

    #[serde(default = "default::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Send/recv timeout for the short-lived handshake RPCs.
    #[serde(default = "default::rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl NodeConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config = toml::from_str(content)
            .with_context(|| "failed to parse node config".to_string())?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse node config at {}", path.display()))?;
        Ok(config)
    }

    pub fn local_node(&self) -> Node {
        Node::new(self.local_ip.clone(), self.local_port)
    }

    pub fn sync_port(&self) -> u16 {
        self.local_port + PORT_SHIFT_SYNC
    }

    pub fn rsync_port(&self) -> u16 {
        self.local_port + PORT_SHIFT_RSYNC
    }

    pub fn meta_nodes(&self) -> Result<Vec<Node>> {
        self.meta_addr.iter().map(|addr| addr.parse()).collect()
    }
}

mod default {
    use std::path::PathBuf;

    pub fn local_ip() -> String {
        "127.0.0.1".to_string()
    }

    pub fn local_port() -> u16 {
        9221
    }

    pub fn worker_num() -> usize {
        4
    }

    pub fn binlog_receive_worker_num() -> usize {
        4
    }

    pub fn binlog_send_worker_num() -> usize {
        4
    }

    pub fn data_path() -> PathBuf {
        PathBuf::from("./data")
    }

    pub fn log_path() -> PathBuf {
        PathBuf::from("./log")
    }

    pub fn db_sync_path() -> PathBuf {
        PathBuf::from("./dbsync")
    }

    pub fn binlog_file_size() -> u64 {
        64 * 1024 * 1024
    }

    pub fn binlog_retain_segments() -> u32 {
        10
    }

    pub fn sync_batch_size() -> usize {
        64
    }

    pub fn ping_interval_ms() -> u64 {
        3000
    }

    pub fn trysync_interval_ms() -> u64 {
        3000
    }

    pub fn connect_timeout_ms() -> u64 {
        1500
    }

    pub fn rpc_timeout_ms() -> u64 {
        1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.local_port, 9221);
        assert_eq!(config.worker_num, 4);
        assert_eq!(config.sync_port(), 9221 + PORT_SHIFT_SYNC);
        assert!(config.meta_addr.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let config = NodeConfig::from_toml(
            r#"
            local_ip = "10.0.0.2"
            local_port = 8001
            meta_addr = ["10.0.0.1:9100", "10.0.0.3:9100"]
            binlog_file_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.local_node(), Node::new("10.0.0.2", 8001));
        assert_eq!(config.binlog_file_size, 4096);
        let metas = config.meta_nodes().unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0], Node::new("10.0.0.1", 9100));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(NodeConfig::from_toml("local_protr = 1").is_err());
    }
}
