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

//! Meta-plane protocol: heartbeats and partition-map pulls from data nodes,
//! and the admin surface used by clients.

use crate::client::TableOffsets;
use crate::common::{PbNode, StatusCode};

/// Placement state of a partition as decided by meta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartitionMapState {
    Active = 0,
    /// Temporarily disabled, e.g. mid-migration. Writes are rejected.
    Stuck = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(message, optional, tag = "1")]
    pub node: ::core::option::Option<PbNode>,
    #[prost(int64, tag = "2")]
    pub epoch: i64,
    /// Current binlog offsets of every local partition, per table.
    #[prost(message, repeated, tag = "3")]
    pub offsets: ::prost::alloc::vec::Vec<TableOffsets>,
}

/// Full partition-map download. Data nodes identify themselves with `node`;
/// clients ask for a single table by name instead.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullRequest {
    #[prost(message, optional, tag = "1")]
    pub node: ::core::option::Option<PbNode>,
    #[prost(string, tag = "2")]
    pub table_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub partition_num: u32,
}

/// `(table, partition, node)` triple used by the placement admin commands.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BasicArgs {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub partition: u32,
    #[prost(message, optional, tag = "3")]
    pub node: ::core::option::Option<PbNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListArgs {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaCmd {
    #[prost(oneof = "meta_cmd::Cmd", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub cmd: ::core::option::Option<meta_cmd::Cmd>,
}

pub mod meta_cmd {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Cmd {
        #[prost(message, tag = "1")]
        Ping(PingRequest),
        #[prost(message, tag = "2")]
        Pull(PullRequest),
        #[prost(message, tag = "3")]
        Init(InitRequest),
        #[prost(message, tag = "4")]
        SetMaster(BasicArgs),
        #[prost(message, tag = "5")]
        AddSlave(BasicArgs),
        #[prost(message, tag = "6")]
        RemoveSlave(BasicArgs),
        #[prost(message, tag = "7")]
        ListMeta(ListArgs),
        #[prost(message, tag = "8")]
        ListNode(ListArgs),
        #[prost(message, tag = "9")]
        ListTable(ListArgs),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionMap {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(enumeration = "PartitionMapState", tag = "2")]
    pub state_raw: i32,
    #[prost(message, optional, tag = "3")]
    pub master: ::core::option::Option<PbNode>,
    #[prost(message, repeated, tag = "4")]
    pub slaves: ::prost::alloc::vec::Vec<PbNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableMap {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub partitions: ::prost::alloc::vec::Vec<PartitionMap>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullResponse {
    /// The epoch this map was assigned at.
    #[prost(int64, tag = "1")]
    pub version: i64,
    #[prost(message, repeated, tag = "2")]
    pub tables: ::prost::alloc::vec::Vec<TableMap>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(int64, tag = "1")]
    pub epoch: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListMetaResponse {
    #[prost(message, optional, tag = "1")]
    pub leader: ::core::option::Option<PbNode>,
    #[prost(message, repeated, tag = "2")]
    pub followers: ::prost::alloc::vec::Vec<PbNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStatus {
    #[prost(message, optional, tag = "1")]
    pub node: ::core::option::Option<PbNode>,
    /// 0 means up, 1 means down.
    #[prost(uint32, tag = "2")]
    pub status: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNodeResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<NodeStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListTableResponse {
    #[prost(string, repeated, tag = "1")]
    pub tables: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaCmdResponse {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code_raw: i32,
    #[prost(string, tag = "2")]
    pub msg: ::prost::alloc::string::String,
    #[prost(oneof = "meta_cmd_response::Payload", tags = "3, 4, 5, 6, 7")]
    pub payload: ::core::option::Option<meta_cmd_response::Payload>,
}

pub mod meta_cmd_response {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "3")]
        Ping(PingResponse),
        #[prost(message, tag = "4")]
        Pull(PullResponse),
        #[prost(message, tag = "5")]
        ListMeta(ListMetaResponse),
        #[prost(message, tag = "6")]
        ListNode(ListNodeResponse),
        #[prost(message, tag = "7")]
        ListTable(ListTableResponse),
    }
}

impl MetaCmdResponse {
    pub fn code(&self) -> StatusCode {
        StatusCode::try_from(self.code_raw).unwrap_or(StatusCode::Error)
    }

    pub fn ok(&self) -> bool {
        self.code() == StatusCode::Ok
    }
}

impl PartitionMap {
    pub fn state(&self) -> PartitionMapState {
        PartitionMapState::try_from(self.state_raw).unwrap_or(PartitionMapState::Stuck)
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_pull_response_roundtrip() {
        let response = MetaCmdResponse {
            code_raw: StatusCode::Ok as i32,
            msg: String::new(),
            payload: Some(meta_cmd_response::Payload::Pull(PullResponse {
                version: 7,
                tables: vec![TableMap {
                    name: "t".to_string(),
                    partitions: vec![PartitionMap {
                        id: 0,
                        state_raw: PartitionMapState::Active as i32,
                        master: Some(PbNode {
                            ip: "127.0.0.1".to_string(),
                            port: 9221,
                        }),
                        slaves: vec![],
                    }],
                }],
            })),
        };
        let decoded = MetaCmdResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.ok());
    }

    #[test]
    fn test_unknown_map_state_treated_as_stuck() {
        let partition = PartitionMap {
            state_raw: 99,
            ..Default::default()
        };
        assert_eq!(partition.state(), PartitionMapState::Stuck);
    }
}
