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

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Network identity of a node in the cluster. A zeroed [`Node`] is the
/// sentinel for "no master assigned".
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub ip: String,
    pub port: u16,
}

impl Node {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Whether this is the "no master assigned" sentinel.
    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.port == 0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed node address {s:?}")))?;
        if ip.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "malformed node address {s:?}"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument(format!("malformed node port {s:?}")))?;
        Ok(Node::new(ip, port))
    }
}

/// Position in a partition's binlog. Ordered lexicographically on
/// `(file_num, offset)`; advances only by appends to the current segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinlogOffset {
    pub file_num: u32,
    pub offset: u64,
}

impl BinlogOffset {
    pub const fn new(file_num: u32, offset: u64) -> Self {
        Self { file_num, offset }
    }
}

impl fmt::Display for BinlogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.file_num, self.offset)
    }
}

/// Lifecycle state of one partition replica, driven by the meta map and the
/// replication handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PartitionState {
    #[default]
    New,
    TrySync,
    WaitDbSync,
    Active,
    Stuck,
    Leaving,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::New => "New",
            PartitionState::TrySync => "TrySync",
            PartitionState::WaitDbSync => "WaitDBSync",
            PartitionState::Active => "Active",
            PartitionState::Stuck => "Stuck",
            PartitionState::Leaving => "Leaving",
        };
        f.write_str(s)
    }
}

/// Replica role. Follows from the meta map: a replica is [`Role::Master`]
/// iff the map's master equals the local node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Slave,
    Master,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_parse() {
        let node: Node = "10.11.12.13:9221".parse().unwrap();
        assert_eq!(node, Node::new("10.11.12.13", 9221));
        assert!("10.11.12.13".parse::<Node>().is_err());
        assert!(":9221".parse::<Node>().is_err());
        assert!("host:notaport".parse::<Node>().is_err());
        assert!(Node::default().is_empty());
        assert!(!node.is_empty());
    }

    #[test]
    fn test_binlog_offset_order() {
        let a = BinlogOffset::new(0, 1024);
        let b = BinlogOffset::new(0, 2048);
        let c = BinlogOffset::new(1, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, BinlogOffset::new(0, 1024));
    }
}
