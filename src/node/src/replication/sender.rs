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

//! Binlog sender pool: one ordered send task per `(table, partition,
//! follower)`, drained by a fixed set of workers. A worker owns a task for
//! one batch at a time, which keeps the per-follower stream in binlog
//! order without any per-record locking.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use tidekv_common::error::Error;
use tidekv_common::types::{BinlogOffset, Node};
use tidekv_proto::client::{CmdRequest, ReplicateRequest};
use tidekv_proto::common::PbSyncOffset;
use tidekv_storage::BinlogReader;
use tokio::sync::{watch, Notify};

use crate::replication::peer::sync_endpoint;
use crate::server::DataServer;

const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const FETCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type TaskKey = (String, u32, Node);

pub fn task_name(table: &str, partition_id: u32, node: &Node) -> String {
    format!("{table}_{partition_id}_{node}")
}

#[derive(Clone, Debug)]
pub struct BinlogSendTask {
    pub table: String,
    pub partition_id: u32,
    pub node: Node,
    pub cursor: BinlogOffset,
}

#[derive(Debug)]
struct Slot {
    task: BinlogSendTask,
    busy: bool,
    /// Reached the binlog tail; woken again by `notify_new_data`.
    parked: bool,
    /// Cursor replacement arriving while the task is checked out; applied
    /// only after the current send iteration completes.
    pending_cursor: Option<BinlogOffset>,
    removed: bool,
}

#[derive(Default)]
struct PoolInner {
    slots: HashMap<TaskKey, Slot>,
    idle: VecDeque<TaskKey>,
}

/// Shared task map of the sender workers.
#[derive(Default)]
pub struct BinlogSendTaskPool {
    inner: Mutex<PoolInner>,
    notify: Notify,
}

impl BinlogSendTaskPool {
    /// Registers a task, or repositions the cursor of an existing one.
    pub fn add_new_task(&self, table: &str, partition_id: u32, node: Node, cursor: BinlogOffset) {
        let key = (table.to_string(), partition_id, node.clone());
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&key) {
            Some(slot) => {
                slot.removed = false;
                if slot.busy {
                    slot.pending_cursor = Some(cursor);
                } else {
                    slot.task.cursor = cursor;
                    if slot.parked {
                        slot.parked = false;
                        inner.idle.push_back(key);
                    }
                }
            }
            None => {
                inner.slots.insert(
                    key.clone(),
                    Slot {
                        task: BinlogSendTask {
                            table: table.to_string(),
                            partition_id,
                            node,
                            cursor,
                        },
                        busy: false,
                        parked: false,
                        pending_cursor: None,
                        removed: false,
                    },
                );
                inner.idle.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Removes a task; one held by a worker is dropped when put back.
    pub fn remove_task(&self, table: &str, partition_id: u32, node: &Node) {
        let key = (table.to_string(), partition_id, node.clone());
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&key) {
            if slot.busy {
                slot.removed = true;
            } else {
                inner.slots.remove(&key);
            }
        }
    }

    /// Removes every follower task of one partition.
    pub fn remove_partition_tasks(&self, table: &str, partition_id: u32) {
        let mut inner = self.inner.lock();
        let keys: Vec<TaskKey> = inner
            .slots
            .keys()
            .filter(|(t, id, _)| t == table && *id == partition_id)
            .cloned()
            .collect();
        for key in keys {
            let slot = inner.slots.get_mut(&key).unwrap();
            if slot.busy {
                slot.removed = true;
            } else {
                inner.slots.remove(&key);
            }
        }
    }

    /// Cursor file number of a task: `-1` if absent, `-2` if held by a
    /// worker right now.
    pub fn task_filenum(&self, table: &str, partition_id: u32, node: &Node) -> i32 {
        let key = (table.to_string(), partition_id, node.clone());
        let inner = self.inner.lock();
        match inner.slots.get(&key) {
            None => -1,
            Some(slot) if slot.busy => -2,
            Some(slot) => slot.task.cursor.file_num as i32,
        }
    }

    /// The lowest cursor file number across a partition's tasks, bounding
    /// which binlog segments are still needed.
    pub fn min_cursor_filenum(&self, table: &str, partition_id: u32) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|((t, id, _), _)| t == table && *id == partition_id)
            .map(|(_, slot)| {
                slot.pending_cursor
                    .map_or(slot.task.cursor.file_num, |c| {
                        c.file_num.min(slot.task.cursor.file_num)
                    })
            })
            .min()
    }

    fn fetch(&self) -> Option<BinlogSendTask> {
        let mut inner = self.inner.lock();
        while let Some(key) = inner.idle.pop_front() {
            let Some(slot) = inner.slots.get_mut(&key) else {
                continue;
            };
            if slot.busy || slot.parked || slot.removed {
                continue;
            }
            slot.busy = true;
            return Some(slot.task.clone());
        }
        None
    }

    fn put_back(&self, task: BinlogSendTask, reached_tail: bool) {
        let key = (task.table.clone(), task.partition_id, task.node.clone());
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(&key) else {
            return;
        };
        if slot.removed {
            inner.slots.remove(&key);
            return;
        }
        slot.busy = false;
        let replaced = slot.pending_cursor.take();
        slot.task.cursor = replaced.unwrap_or(task.cursor);
        if reached_tail && replaced.is_none() {
            slot.parked = true;
        } else {
            inner.idle.push_back(key);
            self.notify.notify_one();
        }
    }

    fn discard(&self, task: &BinlogSendTask) {
        let key = (task.table.clone(), task.partition_id, task.node.clone());
        self.inner.lock().slots.remove(&key);
    }

    /// Wakes tasks parked at the tail; called from the partition write path
    /// after an append.
    pub fn notify_new_data(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<TaskKey> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.parked && !slot.busy)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            inner.slots.get_mut(&key).unwrap().parked = false;
            inner.idle.push_back(key);
        }
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn dump(&self) {
        let inner = self.inner.lock();
        for ((table, partition_id, node), slot) in &inner.slots {
            tracing::debug!(
                task = task_name(table, *partition_id, node),
                cursor = %slot.task.cursor,
                busy = slot.busy,
                parked = slot.parked,
                "binlog send task"
            );
        }
    }
}

enum Disposition {
    /// More data may remain; requeue immediately (fairness yield).
    More,
    /// Caught up with the binlog tail.
    Tail,
    /// Transport trouble; retry after a pause.
    Backoff,
    /// The task no longer applies (role flip, peer removed, cursor gone).
    Remove,
}

/// One sender worker: repeatedly checks a task out of the pool and drains
/// up to one batch from its binlog position.
pub async fn run_sender(server: Arc<DataServer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(mut task) = server.send_pool.fetch() else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::timeout(FETCH_POLL_INTERVAL, server.send_pool.notified()) => {}
            }
            continue;
        };

        match drain_batch(&server, &mut task).await {
            Disposition::More => server.send_pool.put_back(task, false),
            Disposition::Tail => server.send_pool.put_back(task, true),
            Disposition::Backoff => {
                tokio::time::sleep(SEND_RETRY_BACKOFF).await;
                server.send_pool.put_back(task, false);
            }
            Disposition::Remove => server.send_pool.discard(&task),
        }
    }
}

async fn drain_batch(server: &Arc<DataServer>, task: &mut BinlogSendTask) -> Disposition {
    let Some(partition) = server
        .registry
        .get_table_partition_by_id(&task.table, task.partition_id)
    else {
        return Disposition::Remove;
    };
    if !partition.is_master() || !partition.slaves().contains(&task.node) {
        tracing::info!(
            task = task_name(&task.table, task.partition_id, &task.node),
            "dropping send task after master change"
        );
        return Disposition::Remove;
    }

    let binlog = partition.binlog();
    let mut reader = match BinlogReader::new(binlog, task.cursor) {
        Ok(reader) => reader,
        Err(e) => {
            // The cursor fell out of the retained log; the follower has to
            // go through the handshake again.
            tracing::warn!(
                task = task_name(&task.table, task.partition_id, &task.node),
                error = %e,
                "send cursor no longer readable"
            );
            return Disposition::Remove;
        }
    };

    let peer = sync_endpoint(&task.node);
    let mut sent = 0;
    loop {
        if sent >= server.config().sync_batch_size {
            // Yield so other tasks get a turn on this worker.
            return Disposition::More;
        }
        let record_start = reader.position();
        let (payload, record_end) = match reader.next() {
            Ok(Some(record)) => record,
            Ok(None) => return Disposition::Tail,
            Err(e @ Error::Corruption(_)) => {
                tracing::error!(
                    table = task.table,
                    partition = task.partition_id,
                    error = %e,
                    "binlog unreadable mid-log"
                );
                partition.set_stuck();
                return Disposition::Remove;
            }
            Err(e) => {
                tracing::warn!(
                    task = task_name(&task.table, task.partition_id, &task.node),
                    error = %e,
                    "binlog read failed"
                );
                return Disposition::Backoff;
            }
        };

        let cmd = match CmdRequest::decode(payload.as_slice()) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::error!(
                    table = task.table,
                    partition = task.partition_id,
                    error = %e,
                    "undecodable binlog record"
                );
                partition.set_stuck();
                return Disposition::Remove;
            }
        };
        let frame = ReplicateRequest {
            table_name: task.table.clone(),
            sync_offset: Some(PbSyncOffset::new(task.partition_id, record_start)),
            cmd: Some(cmd),
        };
        if let Err(e) = server.peers.send(&peer, &frame).await {
            tracing::warn!(
                task = task_name(&task.table, task.partition_id, &task.node),
                error = %e,
                "replication send failed"
            );
            return Disposition::Backoff;
        }
        task.cursor = record_end;
        sent += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> Node {
        Node::new("127.0.0.1", port)
    }

    #[test]
    fn test_add_replace_fetch() {
        let pool = BinlogSendTaskPool::default();
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(0, 0));
        assert_eq!(pool.task_filenum("t", 0, &node(1)), 0);

        // Duplicate add replaces the cursor in place.
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(3, 9));
        assert_eq!(pool.task_filenum("t", 0, &node(1)), 3);

        let task = pool.fetch().unwrap();
        assert_eq!(task.cursor, BinlogOffset::new(3, 9));
        assert_eq!(pool.task_filenum("t", 0, &node(1)), -2);
        assert!(pool.fetch().is_none());

        pool.put_back(task, false);
        assert_eq!(pool.task_filenum("t", 0, &node(1)), 3);
        assert_eq!(pool.task_filenum("t", 1, &node(1)), -1);
    }

    #[test]
    fn test_replace_while_busy_is_deferred() {
        let pool = BinlogSendTaskPool::default();
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(0, 0));
        let mut task = pool.fetch().unwrap();

        pool.add_new_task("t", 0, node(1), BinlogOffset::new(5, 0));
        // The in-flight iteration advances its own copy...
        task.cursor = BinlogOffset::new(0, 100);
        pool.put_back(task, false);
        // ...but the replacement wins once the iteration completes.
        assert_eq!(pool.task_filenum("t", 0, &node(1)), 5);
    }

    #[test]
    fn test_remove_while_busy() {
        let pool = BinlogSendTaskPool::default();
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(0, 0));
        let task = pool.fetch().unwrap();
        pool.remove_task("t", 0, &node(1));
        // Still present (busy), reported as held.
        assert_eq!(pool.task_filenum("t", 0, &node(1)), -2);
        pool.put_back(task, false);
        assert_eq!(pool.task_filenum("t", 0, &node(1)), -1);
    }

    #[test]
    fn test_parked_until_new_data() {
        let pool = BinlogSendTaskPool::default();
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(0, 0));
        let task = pool.fetch().unwrap();
        pool.put_back(task, true);
        // Parked at tail: not fetchable.
        assert!(pool.fetch().is_none());

        pool.notify_new_data();
        assert!(pool.fetch().is_some());
    }

    #[test]
    fn test_min_cursor_filenum() {
        let pool = BinlogSendTaskPool::default();
        assert_eq!(pool.min_cursor_filenum("t", 0), None);
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(4, 0));
        pool.add_new_task("t", 0, node(2), BinlogOffset::new(2, 7));
        pool.add_new_task("t", 1, node(3), BinlogOffset::new(0, 0));
        assert_eq!(pool.min_cursor_filenum("t", 0), Some(2));
    }

    #[test]
    fn test_remove_partition_tasks() {
        let pool = BinlogSendTaskPool::default();
        pool.add_new_task("t", 0, node(1), BinlogOffset::new(0, 0));
        pool.add_new_task("t", 0, node(2), BinlogOffset::new(0, 0));
        pool.add_new_task("t", 1, node(1), BinlogOffset::new(0, 0));
        pool.remove_partition_tasks("t", 0);
        assert_eq!(pool.task_filenum("t", 0, &node(1)), -1);
        assert_eq!(pool.task_filenum("t", 0, &node(2)), -1);
        assert_eq!(pool.task_filenum("t", 1, &node(1)), 0);
    }
}
