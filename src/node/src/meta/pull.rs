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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror_ext::AsReport;
use tidekv_common::config::META_PORT_SHIFT_CMD;
use tidekv_common::error::{Error, Result};
use tidekv_common::types::Node;
use tidekv_proto::codec::{read_message, write_message};
use tidekv_proto::common::PbNode;
use tidekv_proto::meta::{
    meta_cmd, meta_cmd_response, MetaCmd, MetaCmdResponse, PullRequest, PullResponse,
};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::partition::MapEffects;
use crate::server::DataServer;

/// Single-worker, coalescing pull loop: however many epoch bumps queued up
/// while a pull ran, one successful pull absorbs them all because
/// `should_pull_meta` is level-triggered, not counted.
pub async fn run_meta_pull(server: Arc<DataServer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = server.meta_pull_notified() => {}
        }
        while server.should_pull_meta() && !*shutdown.borrow() {
            match pull_once(&server).await {
                Ok(epoch) => {
                    server.finish_pull_meta(epoch);
                }
                Err(e) => {
                    tracing::warn!(error = %e.as_report(), "meta pull failed, will retry");
                    tokio::time::sleep(Duration::from_millis(
                        server.config().trysync_interval_ms,
                    ))
                    .await;
                }
            }
        }
    }
}

async fn pull_once(server: &Arc<DataServer>) -> Result<i64> {
    let meta = server
        .meta_target()
        .ok_or_else(|| Error::Unavailable("no meta selected yet".to_string()))?;
    let config = server.config();

    let stream = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect((meta.ip.as_str(), meta.port + META_PORT_SHIFT_CMD)),
    )
    .await
    .map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to meta {meta} timed out"),
        ))
    })??;
    let mut stream = stream;

    let request = MetaCmd {
        cmd: Some(meta_cmd::Cmd::Pull(PullRequest {
            node: Some(PbNode::from(&server.local_node())),
            table_name: String::new(),
        })),
    };
    write_message(&mut stream, &request).await?;
    let response: MetaCmdResponse = read_message(&mut stream)
        .await?
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "meta closed the connection",
            ))
        })?;
    if !response.ok() {
        return Err(Error::Internal(anyhow::anyhow!(
            "meta rejected pull: {}",
            response.msg
        )));
    }
    let pull = match response.payload {
        Some(meta_cmd_response::Payload::Pull(pull)) => pull,
        _ => return Err(Error::Corruption("pull answer without map".to_string())),
    };

    let version = pull.version;
    apply_partition_map(server, pull);
    tracing::info!(epoch = version, "partition map applied");
    Ok(version)
}

/// Reconciles the full map with local state under the registry writer
/// lock, so no request worker observes a half-applied map. Tables absent
/// from the map are no longer ours: all their partitions drain toward
/// `Leaving`.
fn apply_partition_map(server: &Arc<DataServer>, pull: PullResponse) {
    let mut apply = server.registry.begin_apply();
    let mut missing: HashSet<String> = apply.table_names().into_iter().collect();

    for table_map in pull.tables {
        if table_map.name.is_empty() {
            tracing::warn!("skipping unnamed table in partition map");
            continue;
        }
        missing.remove(&table_map.name);

        let table = apply.get_or_add_table(&table_map.name);
        table.set_partition_count(table_map.partitions.len() as u32);
        for entry in table_map.partitions {
            let master = match &entry.master {
                Some(master) => Node::from(master),
                None => continue,
            };
            // Not placed yet; nothing to host.
            if master.is_empty() {
                continue;
            }
            let slaves: Vec<Node> = entry.slaves.iter().map(Node::from).collect();

            // Only replicas assigned to this node live here.
            let local = server.local_node();
            if master != local && !slaves.contains(&local) {
                continue;
            }

            match table.update_or_add_partition(entry.id, entry.state(), master, slaves) {
                Some((partition, effects)) => {
                    act_on_effects(server, &table_map.name, partition.id(), effects);
                }
                None => {
                    tracing::warn!(
                        table = table_map.name,
                        partition = entry.id,
                        "failed to apply partition map entry"
                    );
                }
            }
        }
    }

    for name in missing {
        if let Some(table) = apply.get_table(&name) {
            tracing::info!(table = name, "table no longer assigned here, leaving");
            for id in table.leave_all_partition() {
                server.send_pool.remove_partition_tasks(&name, id);
            }
        }
    }
}

fn act_on_effects(server: &Arc<DataServer>, table: &str, partition_id: u32, effects: MapEffects) {
    if effects.need_trysync {
        server.schedule_trysync(table, partition_id);
    }
    if effects.lost_mastership {
        server.send_pool.remove_partition_tasks(table, partition_id);
    }
    for slave in effects.removed_slaves {
        server.send_pool.remove_task(table, partition_id, &slave);
    }
}
