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

//! Request dispatch. Each wire request kind maps to one handler;
//! read/write/admin classification is a static property of the kind.

use std::sync::Arc;

use tidekv_common::error::Error;
use tidekv_common::types::Node;
use tidekv_proto::client::{
    cmd_request, cmd_response, CmdRequest, CmdResponse, DelRequest, GetRequest, GetResponse,
    InfoCapacityResponse, InfoPartitionResponse, InfoRequest, InfoStatsResponse, SetRequest,
    SyncRequest, SyncResponse,
};
use tidekv_proto::common::{PbNode, PbSyncOffset, StatusCode};

use crate::server::DataServer;

/// Whether a request kind mutates partition state.
pub fn is_write(cmd: &cmd_request::Cmd) -> bool {
    matches!(cmd, cmd_request::Cmd::Set(_) | cmd_request::Cmd::Del(_))
}

/// Admin requests are served from node-local bookkeeping, never touching a
/// partition write lock.
pub fn is_admin(cmd: &cmd_request::Cmd) -> bool {
    matches!(
        cmd,
        cmd_request::Cmd::InfoStats(_)
            | cmd_request::Cmd::InfoCapacity(_)
            | cmd_request::Cmd::InfoPartition(_)
            | cmd_request::Cmd::Sync(_)
    )
}

/// The table a request addresses, for per-table statistics.
pub fn table_name(cmd: &cmd_request::Cmd) -> &str {
    match cmd {
        cmd_request::Cmd::Set(SetRequest { table_name, .. })
        | cmd_request::Cmd::Get(GetRequest { table_name, .. })
        | cmd_request::Cmd::Del(DelRequest { table_name, .. })
        | cmd_request::Cmd::InfoStats(InfoRequest { table_name })
        | cmd_request::Cmd::InfoCapacity(InfoRequest { table_name })
        | cmd_request::Cmd::InfoPartition(InfoRequest { table_name })
        | cmd_request::Cmd::Sync(SyncRequest { table_name, .. }) => table_name,
    }
}

pub fn dispatch(server: &Arc<DataServer>, request: CmdRequest) -> CmdResponse {
    let Some(cmd) = request.cmd else {
        return error_response(StatusCode::Error, "unknown request kind");
    };
    match cmd {
        cmd_request::Cmd::Set(set) => handle_set(server, set),
        cmd_request::Cmd::Get(get) => handle_get(server, get),
        cmd_request::Cmd::Del(del) => handle_del(server, del),
        cmd_request::Cmd::InfoStats(info) => handle_info_stats(server, info),
        cmd_request::Cmd::InfoCapacity(info) => handle_info_capacity(server, info),
        cmd_request::Cmd::InfoPartition(info) => handle_info_partition(server, info),
        cmd_request::Cmd::Sync(sync) => handle_sync(server, sync),
    }
}

fn ok_response(payload: Option<cmd_response::Payload>) -> CmdResponse {
    CmdResponse {
        code_raw: StatusCode::Ok as i32,
        msg: String::new(),
        redirect: None,
        payload,
    }
}

fn error_response(code: StatusCode, msg: impl Into<String>) -> CmdResponse {
    CmdResponse {
        code_raw: code as i32,
        msg: msg.into(),
        redirect: None,
        payload: None,
    }
}

/// Maps a partition error onto the wire: a known master becomes a `Move`
/// hint, an unassigned or mid-transition partition asks the client to wait.
fn status_response(err: Error) -> CmdResponse {
    match err {
        Error::NotLeader { master } if !master.is_empty() => CmdResponse {
            code_raw: StatusCode::Move as i32,
            msg: "not the partition master".to_string(),
            redirect: Some(PbNode::from(&master)),
            payload: None,
        },
        Error::NotLeader { .. } => error_response(StatusCode::Wait, "no master assigned"),
        Error::Unavailable(msg) => error_response(StatusCode::Wait, msg),
        Error::NotFound(what) => error_response(StatusCode::NotFound, what),
        e => error_response(StatusCode::Error, e.to_string()),
    }
}

fn handle_set(server: &Arc<DataServer>, set: SetRequest) -> CmdResponse {
    let Some(partition) = server.registry.get_table_partition(&set.table_name, &set.key) else {
        return error_response(StatusCode::Error, "table or partition not hosted here");
    };
    match partition.handle_write(&cmd_request::Cmd::Set(set)) {
        Ok(_) => {
            server.send_pool.notify_new_data();
            ok_response(None)
        }
        Err(e) => status_response(e),
    }
}

fn handle_del(server: &Arc<DataServer>, del: DelRequest) -> CmdResponse {
    let Some(partition) = server.registry.get_table_partition(&del.table_name, &del.key) else {
        return error_response(StatusCode::Error, "table or partition not hosted here");
    };
    match partition.handle_write(&cmd_request::Cmd::Del(del)) {
        Ok(_) => {
            server.send_pool.notify_new_data();
            ok_response(None)
        }
        Err(e) => status_response(e),
    }
}

fn handle_get(server: &Arc<DataServer>, get: GetRequest) -> CmdResponse {
    let Some(partition) = server.registry.get_table_partition(&get.table_name, &get.key) else {
        return error_response(StatusCode::Error, "table or partition not hosted here");
    };
    match partition.handle_read(&get.key) {
        Ok(Some(value)) => ok_response(Some(cmd_response::Payload::Get(GetResponse { value }))),
        Ok(None) => error_response(StatusCode::NotFound, "key not found"),
        Err(e) => status_response(e),
    }
}

fn handle_info_stats(server: &Arc<DataServer>, info: InfoRequest) -> CmdResponse {
    ok_response(Some(cmd_response::Payload::InfoStats(InfoStatsResponse {
        info_stats: server.stats.table_stats(&info.table_name),
    })))
}

fn handle_info_capacity(server: &Arc<DataServer>, info: InfoRequest) -> CmdResponse {
    ok_response(Some(cmd_response::Payload::InfoCapacity(
        InfoCapacityResponse {
            info_capacity: server.registry.capacity_stats(&info.table_name),
        },
    )))
}

fn handle_info_partition(server: &Arc<DataServer>, info: InfoRequest) -> CmdResponse {
    ok_response(Some(cmd_response::Payload::InfoPartition(
        InfoPartitionResponse {
            info_partition: server.registry.dump_binlog_offsets(&info.table_name),
        },
    )))
}

/// Follower catch-up handshake, served by the partition master.
///
/// The offered offset decides the answer: inside the retained log it is
/// accepted and a send task starts streaming there; below the earliest
/// retained segment the follower needs a snapshot (`Wait`); anything else
/// is unusable and the master dictates its own tail (`Fallback`).
fn handle_sync(server: &Arc<DataServer>, sync: SyncRequest) -> CmdResponse {
    let Some(follower) = sync.node.as_ref().map(Node::from) else {
        return error_response(StatusCode::Error, "sync without node identity");
    };
    let Some(sync_offset) = sync.sync_offset else {
        return error_response(StatusCode::Error, "sync without offset");
    };
    let local_epoch = server.epoch();
    if sync.epoch < local_epoch {
        return error_response(
            StatusCode::Error,
            format!("stale epoch {}, current is {local_epoch}", sync.epoch),
        );
    }

    let partition_id = sync_offset.partition;
    let Some(partition) = server
        .registry
        .get_table_partition_by_id(&sync.table_name, partition_id)
    else {
        return error_response(StatusCode::Error, "partition not hosted here");
    };
    if !partition.is_master() {
        let master = partition.master_node();
        return status_response(Error::NotLeader { master });
    }
    if !partition.slaves().contains(&follower) {
        return error_response(
            StatusCode::Error,
            format!("{follower} is not a registered slave"),
        );
    }

    let offset = sync_offset.binlog_offset();
    let binlog = partition.binlog();
    if offset < binlog.earliest_offset() {
        // The prefix is purged; seed the follower with a checkpoint. The
        // send task is registered once the follower re-syncs at the
        // checkpoint offset.
        tracing::info!(
            table = sync.table_name,
            partition = partition_id,
            follower = %follower,
            offset = %offset,
            "sync offset purged, scheduling db sync"
        );
        server.schedule_db_sync(partition, follower);
        return error_response(StatusCode::Wait, "snapshot bootstrap required");
    }
    if !binlog.contains(offset) {
        let tail = binlog.latest_offset();
        tracing::info!(
            table = sync.table_name,
            partition = partition_id,
            follower = %follower,
            offset = %offset,
            tail = %tail,
            "unusable sync offset, answering fallback"
        );
        return CmdResponse {
            code_raw: StatusCode::Fallback as i32,
            msg: "sync offset out of range".to_string(),
            redirect: None,
            payload: Some(cmd_response::Payload::Sync(SyncResponse {
                sync_offset: Some(PbSyncOffset::new(partition_id, tail)),
            })),
        };
    }

    server
        .send_pool
        .add_new_task(&sync.table_name, partition_id, follower.clone(), offset);
    tracing::info!(
        table = sync.table_name,
        partition = partition_id,
        follower = %follower,
        offset = %offset,
        "sync accepted, send task registered"
    );
    ok_response(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let set = cmd_request::Cmd::Set(SetRequest::default());
        let get = cmd_request::Cmd::Get(GetRequest::default());
        let sync = cmd_request::Cmd::Sync(SyncRequest::default());
        let info = cmd_request::Cmd::InfoStats(InfoRequest::default());

        assert!(is_write(&set));
        assert!(!is_write(&get));
        assert!(!is_write(&sync));
        assert!(is_admin(&sync));
        assert!(is_admin(&info));
        assert!(!is_admin(&set));
    }

    #[test]
    fn test_status_mapping() {
        let response = status_response(Error::NotLeader {
            master: Node::new("10.0.0.2", 9221),
        });
        assert_eq!(response.code(), StatusCode::Move);
        assert_eq!(
            response.redirect.as_ref().map(Node::from),
            Some(Node::new("10.0.0.2", 9221))
        );

        let response = status_response(Error::NotLeader {
            master: Node::default(),
        });
        assert_eq!(response.code(), StatusCode::Wait);

        let response = status_response(Error::Unavailable("stuck".to_string()));
        assert_eq!(response.code(), StatusCode::Wait);
    }
}
