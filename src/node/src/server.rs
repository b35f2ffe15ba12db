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

//! The server context: one value created at startup and threaded to every
//! worker. There is no global state; everything a worker touches hangs off
//! the [`DataServer`] it was spawned with.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror_ext::AsReport;
use tidekv_common::config::NodeConfig;
use tidekv_common::error::Result;
use tidekv_common::types::Node;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::background::BgWorker;
use crate::meta::{ping, pull};
use crate::partition::Partition;
use crate::replication::peer::PeerPool;
use crate::replication::receiver::{self, ReceiveTask};
use crate::replication::sender::{self, BinlogSendTaskPool};
use crate::replication::transfer::{module_name, LocalTransfer, SnapshotTransfer};
use crate::replication::trysync;
use crate::service::client_service;
use crate::stats::ServerStats;
use crate::table::TableRegistry;

const CRON_TICK: Duration = Duration::from_secs(1);
const STATS_WINDOW_TICKS: u64 = 10;
const PURGE_CHECK_TICKS: u64 = 30;
const RECEIVE_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
struct MetaState {
    epoch: i64,
    should_pull: bool,
    target: Option<Node>,
}

pub struct DataServer {
    config: Arc<NodeConfig>,
    local_node: Node,
    meta_nodes: Vec<Node>,
    pub registry: TableRegistry,
    pub send_pool: BinlogSendTaskPool,
    pub peers: PeerPool,
    pub stats: ServerStats,
    bgsave: BgWorker,
    bgpurge: BgWorker,
    transfer: Arc<dyn SnapshotTransfer>,
    rsync_refs: tokio::sync::Mutex<u32>,
    meta_state: parking_lot::Mutex<MetaState>,
    meta_pull_notify: Notify,
    trysync_tx: mpsc::UnboundedSender<(String, u32)>,
    shutdown_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl DataServer {
    /// Binds the client and replication listeners and spawns every worker
    /// loop. The returned handle is the only way workers reach shared
    /// state.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let local_node = config.local_node();
        let meta_nodes = config.meta_nodes()?;

        std::fs::create_dir_all(&config.data_path)?;
        std::fs::create_dir_all(&config.log_path)?;
        std::fs::create_dir_all(&config.db_sync_path)?;

        let client_listener =
            TcpListener::bind((config.local_ip.as_str(), config.local_port)).await?;
        let sync_listener =
            TcpListener::bind((config.local_ip.as_str(), config.sync_port())).await?;

        let (trysync_tx, trysync_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = Arc::new(DataServer {
            registry: TableRegistry::new(config.clone()),
            send_pool: BinlogSendTaskPool::default(),
            peers: PeerPool::new(Duration::from_millis(config.connect_timeout_ms)),
            stats: ServerStats::new(config.worker_num),
            bgsave: BgWorker::new("bgsave"),
            bgpurge: BgWorker::new("bgpurge"),
            transfer: Arc::new(LocalTransfer),
            rsync_refs: tokio::sync::Mutex::new(0),
            meta_state: parking_lot::Mutex::new(MetaState {
                epoch: -1,
                should_pull: false,
                target: None,
            }),
            meta_pull_notify: Notify::new(),
            trysync_tx,
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
            local_node,
            meta_nodes,
            config,
        });

        // Spawn order mirrors the teardown order below.
        let mut handles = vec![
            (
                "ping",
                tokio::spawn(ping::run_ping(server.clone(), shutdown_rx.clone())),
            ),
            (
                "dispatcher",
                tokio::spawn(client_service::run_dispatcher(
                    server.clone(),
                    client_listener,
                    shutdown_rx.clone(),
                )),
            ),
        ];
        for _ in 0..server.config.binlog_send_worker_num {
            handles.push((
                "binlog_sender",
                tokio::spawn(sender::run_sender(server.clone(), shutdown_rx.clone())),
            ));
        }

        let mut dispatch = Vec::with_capacity(server.config.binlog_receive_worker_num);
        for _ in 0..server.config.binlog_receive_worker_num {
            let (tx, rx) = mpsc::channel::<ReceiveTask>(RECEIVE_QUEUE_DEPTH);
            dispatch.push(tx);
            handles.push((
                "binlog_apply",
                tokio::spawn(receiver::run_apply_worker(
                    server.clone(),
                    rx,
                    shutdown_rx.clone(),
                )),
            ));
        }
        handles.push((
            "binlog_receiver",
            tokio::spawn(receiver::run_receiver(
                sync_listener,
                Arc::new(dispatch),
                shutdown_rx.clone(),
            )),
        ));
        handles.push((
            "trysync",
            tokio::spawn(trysync::run_trysync(
                server.clone(),
                trysync_rx,
                shutdown_rx.clone(),
            )),
        ));
        handles.push((
            "meta_pull",
            tokio::spawn(pull::run_meta_pull(server.clone(), shutdown_rx.clone())),
        ));
        handles.push((
            "cron",
            tokio::spawn(run_cron(server.clone(), shutdown_rx)),
        ));
        *server.handles.lock() = handles;

        tracing::info!(
            node = %server.local_node,
            sync_port = server.config.sync_port(),
            "data server started"
        );
        Ok(server)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_node(&self) -> Node {
        self.local_node.clone()
    }

    pub fn epoch(&self) -> i64 {
        self.meta_state.lock().epoch
    }

    pub fn should_pull_meta(&self) -> bool {
        self.meta_state.lock().should_pull
    }

    /// Called by the ping worker with the epoch meta reported. Any change
    /// arms the pull gate and wakes the pull worker.
    pub fn try_update_epoch(&self, remote: i64) {
        let mut state = self.meta_state.lock();
        if remote != state.epoch && !state.should_pull {
            tracing::info!(local = state.epoch, remote, "meta epoch changed");
            state.should_pull = true;
            self.meta_pull_notify.notify_one();
        }
    }

    /// Atomically advances the epoch and disarms the pull gate. The epoch
    /// never moves backwards.
    pub fn finish_pull_meta(&self, epoch: i64) {
        let mut state = self.meta_state.lock();
        if epoch < state.epoch {
            tracing::warn!(
                local = state.epoch,
                remote = epoch,
                "ignoring partition map older than the applied one"
            );
        } else {
            tracing::info!(from = state.epoch, to = epoch, "epoch advanced");
            state.epoch = epoch;
        }
        state.should_pull = false;
    }

    pub async fn meta_pull_notified(&self) {
        self.meta_pull_notify.notified().await
    }

    pub fn meta_target(&self) -> Option<Node> {
        self.meta_state.lock().target.clone()
    }

    /// Picks a meta uniformly at random from the configured list.
    pub fn pick_meta(&self) -> Option<Node> {
        if self.meta_nodes.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.meta_nodes.len());
        let meta = self.meta_nodes[index].clone();
        tracing::info!(meta = %meta, "meta selected");
        self.meta_state.lock().target = Some(meta.clone());
        Some(meta)
    }

    pub fn clear_meta_target(&self) {
        self.meta_state.lock().target = None;
    }

    pub fn schedule_trysync(&self, table: &str, partition_id: u32) {
        let _ = self.trysync_tx.send((table.to_string(), partition_id));
    }

    /// Re-enqueues a catch-up attempt after the retry interval.
    pub fn requeue_trysync(&self, table: &str, partition_id: u32) {
        let tx = self.trysync_tx.clone();
        let table = table.to_string();
        let interval = Duration::from_millis(self.config.trysync_interval_ms);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send((table, partition_id));
        });
    }

    /// Starts the snapshot-transfer daemon on first use. The module name
    /// carries the local `ip:port`, so files from a previous master's
    /// daemon cannot land here.
    pub async fn rsync_ref(&self) {
        let mut refs = self.rsync_refs.lock().await;
        if *refs == 0 {
            let module = module_name(&self.local_node);
            if let Err(e) = self.transfer.start(&module, &self.config.db_sync_path).await {
                tracing::warn!(error = %e.as_report(), "failed to start snapshot transfer");
            }
        }
        *refs += 1;
    }

    pub async fn rsync_unref(&self) {
        let mut refs = self.rsync_refs.lock().await;
        debug_assert!(*refs > 0);
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            let module = module_name(&self.local_node);
            if let Err(e) = self.transfer.stop(&module).await {
                tracing::warn!(error = %e.as_report(), "failed to stop snapshot transfer");
            }
        }
    }

    /// Master side of a `Wait` answer: checkpoint the partition and push
    /// the files into the follower's staging module.
    pub fn schedule_db_sync(&self, partition: Arc<Partition>, follower: Node) {
        let transfer = self.transfer.clone();
        let dump_dir = self.config.db_sync_path.join(format!(
            "dump_{}_{}_{}_{}",
            partition.table_name(),
            partition.id(),
            follower.ip,
            follower.port
        ));
        let subpath = format!("{}/{}", partition.table_name(), partition.id());
        self.bgsave.schedule(async move {
            let offset = match partition.bgsave_to(&dump_dir) {
                Ok(offset) => offset,
                Err(e) => {
                    tracing::error!(
                        table = partition.table_name(),
                        partition = partition.id(),
                        error = %e.as_report(),
                        "checkpoint for db sync failed"
                    );
                    return;
                }
            };
            let module = module_name(&follower);
            if let Err(e) = transfer.push(&dump_dir, &module, &subpath).await {
                tracing::error!(
                    table = partition.table_name(),
                    partition = partition.id(),
                    follower = %follower,
                    error = %e.as_report(),
                    "snapshot push failed"
                );
            } else {
                tracing::info!(
                    table = partition.table_name(),
                    partition = partition.id(),
                    follower = %follower,
                    offset = %offset,
                    "snapshot pushed for bootstrap"
                );
            }
            let _ = std::fs::remove_dir_all(&dump_dir);
        });
    }

    /// Stops every loop and flushes partitions. Teardown runs in the spawn
    /// order recorded at startup.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.bgsave.close();
        self.bgpurge.close();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(worker = name, error = %e, "worker exited abnormally");
            }
        }
        self.peers.close_all().await;

        let mut refs = self.rsync_refs.lock().await;
        if *refs > 0 {
            *refs = 0;
            let _ = self.transfer.stop(&module_name(&self.local_node)).await;
        }
        drop(refs);

        self.registry.close_all();
        tracing::info!(node = %self.local_node, "data server stopped");
    }
}

/// Periodic maintenance: refresh the qps window, fsync binlogs, check
/// purge eligibility, and dump state at debug level.
async fn run_cron(server: Arc<DataServer>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(CRON_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        ticks += 1;

        if ticks % STATS_WINDOW_TICKS == 0 {
            server.stats.refresh(STATS_WINDOW_TICKS);
            for name in server.registry.all_table_names() {
                if let Some(table) = server.registry.get_table(&name) {
                    for partition in table.partitions() {
                        partition.do_timing_task();
                    }
                }
            }
        }

        if ticks % PURGE_CHECK_TICKS == 0 {
            schedule_purges(&server);
            server.registry.dump();
            server.send_pool.dump();
        }
    }
}

/// Purges binlog segments below both the minimum follower cursor and the
/// retention watermark.
fn schedule_purges(server: &Arc<DataServer>) {
    for name in server.registry.all_table_names() {
        let Some(table) = server.registry.get_table(&name) else {
            continue;
        };
        for partition in table.partitions() {
            let binlog = partition.binlog();
            let tail = binlog.latest_offset();
            let watermark = tail
                .file_num
                .saturating_sub(server.config.binlog_retain_segments);
            let limit = match server.send_pool.min_cursor_filenum(&name, partition.id()) {
                Some(cursor) => watermark.min(cursor),
                None => watermark,
            };
            if limit > binlog.earliest_offset().file_num {
                let table_name = name.clone();
                let id = partition.id();
                server.bgpurge.schedule(async move {
                    match binlog.purge_to(limit) {
                        Ok(purged) if purged > 0 => {
                            tracing::info!(
                                table = table_name,
                                partition = id,
                                upto = limit,
                                purged,
                                "purged binlog segments"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(
                                table = table_name,
                                partition = id,
                                error = %e.as_report(),
                                "binlog purge failed"
                            );
                        }
                    }
                });
            }
        }
    }
}
