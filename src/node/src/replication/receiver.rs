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

//! Replication ingress. Frames are dispatched to the apply worker at
//! `partition_id % R`: a follower partition has exactly one master and one
//! inbound stream, so sharding by partition id preserves per-partition
//! apply order with no cross-worker coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tidekv_common::error::Error;
use tidekv_common::types::BinlogOffset;
use tidekv_proto::client::{CmdRequest, ReplicateRequest};
use tidekv_proto::codec::read_message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::server::DataServer;

pub struct ReceiveTask {
    table: String,
    partition_id: u32,
    expected: BinlogOffset,
    request: CmdRequest,
    /// Set by the apply worker on divergence; tells the connection task to
    /// drop the stream.
    poison: Arc<AtomicBool>,
}

/// Accept loop on the sync port.
pub async fn run_receiver(
    listener: TcpListener,
    dispatch: Arc<Vec<mpsc::Sender<ReceiveTask>>>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut shutdown_rx = shutdown.clone();
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, "replication stream connected");
                        tokio::spawn(handle_stream(
                            stream,
                            dispatch.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "replication accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_stream(
    mut stream: TcpStream,
    dispatch: Arc<Vec<mpsc::Sender<ReceiveTask>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let poison = Arc::new(AtomicBool::new(false));
    loop {
        let frame: ReplicateRequest = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_message(&mut stream) => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "replication stream broken");
                    break;
                }
            }
        };
        let Some(sync_offset) = frame.sync_offset else {
            tracing::warn!("replication frame without offset");
            break;
        };
        let task = ReceiveTask {
            table: frame.table_name,
            partition_id: sync_offset.partition,
            expected: sync_offset.binlog_offset(),
            request: frame.cmd.unwrap_or_default(),
            poison: poison.clone(),
        };
        let shard = sync_offset.partition as usize % dispatch.len();
        if dispatch[shard].send(task).await.is_err() {
            break;
        }
        if poison.load(Ordering::Acquire) {
            break;
        }
    }
}

/// One apply worker: owns the partitions whose id hashes to it, applies
/// each frame to the store and the local binlog at the exact expected
/// offset.
pub async fn run_apply_worker(
    server: Arc<DataServer>,
    mut rx: mpsc::Receiver<ReceiveTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            }
        };
        apply_task(&server, task);
    }
}

fn apply_task(server: &Arc<DataServer>, task: ReceiveTask) {
    let Some(partition) = server
        .registry
        .get_table_partition_by_id(&task.table, task.partition_id)
    else {
        tracing::debug!(
            table = task.table,
            partition = task.partition_id,
            "replicated frame for unknown partition"
        );
        task.poison.store(true, Ordering::Release);
        return;
    };

    match partition.apply_replicated(&task.request, task.expected) {
        Ok(()) => {}
        Err(Error::InvalidArgument(msg)) => {
            // Offset gap: this replica diverged from the stream. Drop the
            // connection and go back through the handshake.
            tracing::warn!(
                table = task.table,
                partition = task.partition_id,
                "{msg}; falling back to catch-up"
            );
            if partition.set_trysync() {
                server.schedule_trysync(&task.table, task.partition_id);
            }
            task.poison.store(true, Ordering::Release);
        }
        Err(Error::Unavailable(msg)) => {
            // A stream for a role we no longer hold; just shed it.
            tracing::debug!(
                table = task.table,
                partition = task.partition_id,
                "dropping replicated frame: {msg}"
            );
            task.poison.store(true, Ordering::Release);
        }
        Err(e) => {
            tracing::error!(
                table = task.table,
                partition = task.partition_id,
                error = %e,
                "replicated apply failed"
            );
            task.poison.store(true, Ordering::Release);
        }
    }
}
