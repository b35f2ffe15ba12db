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

//! Data-plane protocol: client requests served on the client port, and the
//! replication stream exchanged between peers on the sync port.

use crate::common::{PbNode, PbSyncOffset, StatusCode};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DelRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: ::prost::alloc::vec::Vec<u8>,
}

/// Shared by the `INFO*` commands. An empty `table_name` means all tables.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
}

/// Follower-to-master handshake: resume replication of one partition from
/// the carried binlog offset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {
    #[prost(message, optional, tag = "1")]
    pub node: ::core::option::Option<PbNode>,
    #[prost(string, tag = "2")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub sync_offset: ::core::option::Option<PbSyncOffset>,
    /// Epoch the follower acted on; the master rejects stale ones.
    #[prost(int64, tag = "4")]
    pub epoch: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdRequest {
    #[prost(oneof = "cmd_request::Cmd", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub cmd: ::core::option::Option<cmd_request::Cmd>,
}

pub mod cmd_request {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Cmd {
        #[prost(message, tag = "1")]
        Set(SetRequest),
        #[prost(message, tag = "2")]
        Get(GetRequest),
        #[prost(message, tag = "3")]
        Del(DelRequest),
        #[prost(message, tag = "4")]
        InfoStats(InfoRequest),
        #[prost(message, tag = "5")]
        InfoCapacity(InfoRequest),
        #[prost(message, tag = "6")]
        InfoPartition(InfoRequest),
        #[prost(message, tag = "7")]
        Sync(SyncRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

/// Answer to a [`SyncRequest`] that cannot be served as-is: carries the
/// offset to fall back to.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncResponse {
    #[prost(message, optional, tag = "1")]
    pub sync_offset: ::core::option::Option<PbSyncOffset>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableStats {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub qps: u64,
    #[prost(uint64, tag = "3")]
    pub total_queries: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableCapacity {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub used: u64,
    #[prost(uint64, tag = "3")]
    pub remain: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableOffsets {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub sync_offsets: ::prost::alloc::vec::Vec<PbSyncOffset>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub info_stats: ::prost::alloc::vec::Vec<TableStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoCapacityResponse {
    #[prost(message, repeated, tag = "1")]
    pub info_capacity: ::prost::alloc::vec::Vec<TableCapacity>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoPartitionResponse {
    #[prost(message, repeated, tag = "1")]
    pub info_partition: ::prost::alloc::vec::Vec<TableOffsets>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdResponse {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code_raw: i32,
    #[prost(string, tag = "2")]
    pub msg: ::prost::alloc::string::String,
    /// Set with [`StatusCode::Move`]: the node that owns the partition.
    #[prost(message, optional, tag = "3")]
    pub redirect: ::core::option::Option<PbNode>,
    #[prost(oneof = "cmd_response::Payload", tags = "4, 5, 6, 7, 8")]
    pub payload: ::core::option::Option<cmd_response::Payload>,
}

pub mod cmd_response {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "4")]
        Get(GetResponse),
        #[prost(message, tag = "5")]
        Sync(SyncResponse),
        #[prost(message, tag = "6")]
        InfoStats(InfoStatsResponse),
        #[prost(message, tag = "7")]
        InfoCapacity(InfoCapacityResponse),
        #[prost(message, tag = "8")]
        InfoPartition(InfoPartitionResponse),
    }
}

/// One replicated write, streamed master-to-follower on the sync port.
/// `sync_offset` is the position the command was appended at on the master,
/// which must equal the follower's next expected offset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub sync_offset: ::core::option::Option<PbSyncOffset>,
    #[prost(message, optional, tag = "3")]
    pub cmd: ::core::option::Option<CmdRequest>,
}

impl CmdResponse {
    pub fn code(&self) -> StatusCode {
        StatusCode::try_from(self.code_raw).unwrap_or(StatusCode::Error)
    }

    pub fn ok(&self) -> bool {
        self.code() == StatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_cmd_request_roundtrip() {
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::Set(SetRequest {
                table_name: "t".to_string(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            })),
        };
        let decoded = CmdRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_unknown_status_code_maps_to_error() {
        let response = CmdResponse {
            code_raw: 4242,
            ..Default::default()
        };
        assert_eq!(response.code(), StatusCode::Error);
        assert!(!response.ok());
    }
}
