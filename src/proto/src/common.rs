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

//! Messages shared by the client and meta channels.

use tidekv_common::types::{BinlogOffset, Node};

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct PbNode {
    #[prost(string, tag = "1")]
    pub ip: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

/// Binlog position of one partition, as carried on the wire.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PbSyncOffset {
    #[prost(uint32, tag = "1")]
    pub partition: u32,
    #[prost(uint32, tag = "2")]
    pub file_num: u32,
    #[prost(uint64, tag = "3")]
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    NotFound = 1,
    Error = 2,
    NotLeader = 3,
    /// Snapshot bootstrap is required; the follower must wait for it.
    Wait = 4,
    /// The requested offset is unusable; resume from the carried one.
    Fallback = 5,
    /// The addressed node does not own the partition; the carried node does.
    Move = 6,
}

impl From<&Node> for PbNode {
    fn from(node: &Node) -> Self {
        PbNode {
            ip: node.ip.clone(),
            port: node.port as u32,
        }
    }
}

impl From<&PbNode> for Node {
    fn from(pb: &PbNode) -> Self {
        Node::new(pb.ip.clone(), pb.port as u16)
    }
}

impl PbSyncOffset {
    pub fn new(partition: u32, offset: BinlogOffset) -> Self {
        PbSyncOffset {
            partition,
            file_num: offset.file_num,
            offset: offset.offset,
        }
    }

    pub fn binlog_offset(&self) -> BinlogOffset {
        BinlogOffset::new(self.file_num, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_conversion() {
        let node = Node::new("10.0.0.7", 9221);
        let pb = PbNode::from(&node);
        assert_eq!(Node::from(&pb), node);
    }

    #[test]
    fn test_sync_offset_conversion() {
        let pb = PbSyncOffset::new(3, BinlogOffset::new(7, 4096));
        assert_eq!(pb.partition, 3);
        assert_eq!(pb.binlog_offset(), BinlogOffset::new(7, 4096));
    }
}
