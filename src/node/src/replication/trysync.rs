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

//! The catch-up worker. A follower partition keeps handshaking with its
//! master until replication is running: the master either accepts the
//! offered offset, dictates a fallback offset, or orders a snapshot
//! bootstrap (`Wait`), in which case this worker also polls for the
//! transfer to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror_ext::AsReport;
use tidekv_common::error::Result;
use tidekv_common::types::{BinlogOffset, Node};
use tidekv_proto::client::{cmd_request, CmdRequest, CmdResponse, SyncRequest};
use tidekv_proto::codec::{read_message, write_message};
use tidekv_proto::common::{PbNode, PbSyncOffset, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::partition::Partition;
use crate::server::DataServer;

enum SyncOutcome {
    Accepted,
    Fallback(BinlogOffset),
    Wait,
    Rejected(String),
}

pub async fn run_trysync(
    server: Arc<DataServer>,
    mut rx: mpsc::UnboundedReceiver<(String, u32)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conns: HashMap<Node, TcpStream> = HashMap::new();
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            }
        };
        handle_task(&server, &mut conns, task.0, task.1).await;
    }
}

async fn handle_task(
    server: &Arc<DataServer>,
    conns: &mut HashMap<Node, TcpStream>,
    table: String,
    partition_id: u32,
) {
    let Some(partition) = server
        .registry
        .get_table_partition_by_id(&table, partition_id)
    else {
        return;
    };

    if partition.should_wait_db_sync() {
        match partition.try_update_master_offset() {
            Ok(true) => {
                partition.wait_db_sync_done();
                server.rsync_unref().await;
                tracing::info!(table, partition = partition_id, "db sync files applied");
            }
            Ok(false) => {
                // Files still in flight; poll again.
                server.requeue_trysync(&table, partition_id);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    table,
                    partition = partition_id,
                    error = %e.as_report(),
                    "failed to apply db sync files"
                );
                server.requeue_trysync(&table, partition_id);
                return;
            }
        }
    }

    if !partition.should_try_sync() {
        return;
    }
    let master = partition.master_node();
    if master.is_empty() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(partition.sync_dir()) {
        tracing::warn!(
            table,
            partition = partition_id,
            error = %e,
            "failed to prepare sync staging dir"
        );
    }

    // Keep the transfer daemon up for the duration of the handshake; a
    // `Wait` answer takes an extra reference that lives until bootstrap
    // completes.
    server.rsync_ref().await;
    match handshake(server, conns, &partition, &master).await {
        Ok(SyncOutcome::Accepted) => {
            partition.try_sync_done();
            tracing::info!(
                table,
                partition = partition_id,
                master = %master,
                "sync accepted, replication running"
            );
        }
        Ok(SyncOutcome::Fallback(offset)) => {
            tracing::info!(
                table,
                partition = partition_id,
                offset = %offset,
                "master dictated fallback offset"
            );
            if let Err(e) = partition.set_binlog_offset(offset) {
                tracing::warn!(
                    table,
                    partition = partition_id,
                    error = %e.as_report(),
                    "failed to apply fallback offset"
                );
            }
            server.requeue_trysync(&table, partition_id);
        }
        Ok(SyncOutcome::Wait) => {
            server.rsync_ref().await;
            partition.set_wait_db_sync();
            tracing::info!(
                table,
                partition = partition_id,
                "master will bootstrap us, waiting for db sync"
            );
            server.requeue_trysync(&table, partition_id);
        }
        Ok(SyncOutcome::Rejected(msg)) => {
            tracing::warn!(
                table,
                partition = partition_id,
                master = %master,
                msg,
                "sync rejected"
            );
            server.requeue_trysync(&table, partition_id);
        }
        Err(e) => {
            tracing::warn!(
                table,
                partition = partition_id,
                master = %master,
                error = %e.as_report(),
                "sync handshake failed"
            );
            conns.remove(&master);
            server.requeue_trysync(&table, partition_id);
        }
    }
    server.rsync_unref().await;
}

async fn handshake(
    server: &Arc<DataServer>,
    conns: &mut HashMap<Node, TcpStream>,
    partition: &Arc<Partition>,
    master: &Node,
) -> Result<SyncOutcome> {
    let rpc_timeout = Duration::from_millis(server.config().rpc_timeout_ms);
    if !conns.contains_key(master) {
        let stream = tokio::time::timeout(
            Duration::from_millis(server.config().connect_timeout_ms),
            TcpStream::connect((master.ip.as_str(), master.port)),
        )
        .await
        .map_err(|_| timeout_error("connect", master))??;
        conns.insert(master.clone(), stream);
    }
    let stream = conns.get_mut(master).unwrap();

    let offset = partition.binlog_offset();
    let request = CmdRequest {
        cmd: Some(cmd_request::Cmd::Sync(SyncRequest {
            node: Some(PbNode::from(&server.local_node())),
            table_name: partition.table_name().to_string(),
            sync_offset: Some(PbSyncOffset::new(partition.id(), offset)),
            epoch: server.epoch(),
        })),
    };
    tokio::time::timeout(rpc_timeout, write_message(stream, &request))
        .await
        .map_err(|_| timeout_error("send", master))??;

    let response: CmdResponse = tokio::time::timeout(rpc_timeout, read_message(stream))
        .await
        .map_err(|_| timeout_error("recv", master))??
        .ok_or_else(|| {
            tidekv_common::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "master closed the connection",
            ))
        })?;

    Ok(match response.code() {
        StatusCode::Ok => SyncOutcome::Accepted,
        StatusCode::Wait => SyncOutcome::Wait,
        StatusCode::Fallback => {
            let offset = match response.payload {
                Some(tidekv_proto::client::cmd_response::Payload::Sync(sync)) => {
                    sync.sync_offset.map(|o| o.binlog_offset())
                }
                _ => None,
            };
            match offset {
                Some(offset) => SyncOutcome::Fallback(offset),
                None => SyncOutcome::Rejected("fallback without offset".to_string()),
            }
        }
        _ => SyncOutcome::Rejected(response.msg),
    })
}

fn timeout_error(op: &str, master: &Node) -> tidekv_common::error::Error {
    tidekv_common::error::Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{op} to master {master} timed out"),
    ))
}
