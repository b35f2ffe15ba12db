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

//! Table-to-partition bookkeeping. The registry is read-mostly: every
//! request path takes the reader side; the only writer is the meta-pull
//! worker applying a new partition map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tidekv_common::config::NodeConfig;
use tidekv_common::hash::partition_for_key;
use tidekv_common::types::{Node, PartitionState};
use tidekv_proto::client::{TableCapacity, TableOffsets};
use tidekv_proto::common::PbSyncOffset;
use tidekv_proto::meta::PartitionMapState;

use crate::partition::{MapEffects, Partition};

pub struct Table {
    name: String,
    config: Arc<NodeConfig>,
    local_node: Node,
    partition_count: RwLock<u32>,
    partitions: RwLock<HashMap<u32, Arc<Partition>>>,
}

impl Table {
    fn new(name: &str, config: Arc<NodeConfig>, local_node: Node) -> Self {
        Self {
            name: name.to_string(),
            config,
            local_node,
            partition_count: RwLock::new(0),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        *self.partition_count.read()
    }

    pub fn set_partition_count(&self, count: u32) {
        *self.partition_count.write() = count;
    }

    /// Applies one map entry, creating the replica on first sight. Returns
    /// `None` when the replica cannot be opened; the pull skips it with a
    /// warning and retries on the next epoch.
    pub fn update_or_add_partition(
        &self,
        id: u32,
        state: PartitionMapState,
        master: Node,
        slaves: Vec<Node>,
    ) -> Option<(Arc<Partition>, MapEffects)> {
        let partition = {
            let mut partitions = self.partitions.write();
            match partitions.get(&id) {
                Some(partition) => partition.clone(),
                None => {
                    let partition =
                        match Partition::new(&self.name, id, &self.config, self.local_node.clone())
                        {
                            Ok(partition) => partition,
                            Err(e) => {
                                tracing::warn!(
                                    table = self.name,
                                    partition = id,
                                    error = %e,
                                    "failed to open partition replica"
                                );
                                return None;
                            }
                        };
                    partitions.insert(id, partition.clone());
                    partition
                }
            }
        };
        let effects = partition.update_from_map(state, master, slaves);
        Some((partition, effects))
    }

    /// Routes a key to its partition: `hash(key) mod partition_count`.
    pub fn get_partition(&self, key: &[u8]) -> Option<Arc<Partition>> {
        let count = self.partition_count();
        if count == 0 {
            return None;
        }
        self.get_partition_by_id(partition_for_key(key, count))
    }

    pub fn get_partition_by_id(&self, id: u32) -> Option<Arc<Partition>> {
        self.partitions.read().get(&id).cloned()
    }

    /// This node no longer serves the table: every replica drains toward
    /// `Leaving`. Destruction stays deferred until table ownership handoff
    /// is specified.
    pub fn leave_all_partition(&self) -> Vec<u32> {
        let partitions = self.partitions.read();
        let mut ids: Vec<u32> = partitions.keys().copied().collect();
        ids.sort_unstable();
        for partition in partitions.values() {
            partition.leave();
        }
        ids
    }

    pub fn dump_binlog_offsets(&self) -> TableOffsets {
        let partitions = self.partitions.read();
        let mut sync_offsets: Vec<PbSyncOffset> = partitions
            .iter()
            .map(|(id, partition)| PbSyncOffset::new(*id, partition.binlog_offset()))
            .collect();
        sync_offsets.sort_by_key(|offset| offset.partition);
        TableOffsets {
            table_name: self.name.clone(),
            sync_offsets,
        }
    }

    pub fn capacity(&self) -> TableCapacity {
        let partitions = self.partitions.read();
        let used = partitions
            .values()
            .map(|partition| partition.usage().bytes)
            .sum();
        TableCapacity {
            table_name: self.name.clone(),
            used,
            remain: 0,
        }
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn dump(&self) {
        for partition in self.partitions.read().values() {
            partition.dump();
        }
    }

    fn close(&self) {
        for partition in self.partitions.read().values() {
            if partition.state() == PartitionState::Leaving {
                continue;
            }
            if let Err(e) = partition.close() {
                tracing::warn!(
                    table = self.name,
                    partition = partition.id(),
                    error = %e,
                    "failed to checkpoint partition on close"
                );
            }
        }
    }
}

/// All tables hosted by this node, behind one reader/writer lock so request
/// workers observe either the pre-pull or the post-pull map, never a mix.
pub struct TableRegistry {
    config: Arc<NodeConfig>,
    local_node: Node,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl TableRegistry {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let local_node = config.local_node();
        Self {
            config,
            local_node,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_add_table(&self, name: &str) -> Arc<Table> {
        let mut tables = self.tables.write();
        Self::get_or_add_in(&mut tables, name, &self.config, &self.local_node)
    }

    fn get_or_add_in(
        tables: &mut HashMap<String, Arc<Table>>,
        name: &str,
        config: &Arc<NodeConfig>,
        local_node: &Node,
    ) -> Arc<Table> {
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Table::new(name, config.clone(), local_node.clone())))
            .clone()
    }

    /// Takes the writer lock for a whole map reconcile: request workers
    /// observe either the pre-pull or the post-pull registry, never a
    /// half-applied one.
    pub fn begin_apply(&self) -> RegistryApply<'_> {
        RegistryApply {
            tables: self.tables.write(),
            config: &self.config,
            local_node: &self.local_node,
        }
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    pub fn get_table_partition(&self, table: &str, key: &[u8]) -> Option<Arc<Partition>> {
        self.get_table(table)?.get_partition(key)
    }

    pub fn get_table_partition_by_id(&self, table: &str, id: u32) -> Option<Arc<Partition>> {
        self.get_table(table)?.get_partition_by_id(id)
    }

    pub fn all_table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Offsets of every hosted partition, for the meta ping. An empty
    /// `table_name` dumps all tables.
    pub fn dump_binlog_offsets(&self, table_name: &str) -> Vec<TableOffsets> {
        let tables = self.tables.read();
        let mut offsets: Vec<TableOffsets> = tables
            .values()
            .filter(|table| table_name.is_empty() || table.name() == table_name)
            .map(|table| table.dump_binlog_offsets())
            .collect();
        offsets.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        offsets
    }

    pub fn capacity_stats(&self, table_name: &str) -> Vec<TableCapacity> {
        let tables = self.tables.read();
        let mut stats: Vec<TableCapacity> = tables
            .values()
            .filter(|table| table_name.is_empty() || table.name() == table_name)
            .map(|table| table.capacity())
            .collect();
        stats.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        stats
    }

    pub fn dump(&self) {
        for table in self.tables.read().values() {
            table.dump();
        }
    }

    pub fn close_all(&self) {
        for table in self.tables.read().values() {
            table.close();
        }
    }
}

/// Write-side view of the registry held by the meta-pull worker for one
/// entire reconcile.
pub struct RegistryApply<'a> {
    tables: RwLockWriteGuard<'a, HashMap<String, Arc<Table>>>,
    config: &'a Arc<NodeConfig>,
    local_node: &'a Node,
}

impl RegistryApply<'_> {
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn get_or_add_table(&mut self, name: &str) -> Arc<Table> {
        TableRegistry::get_or_add_in(&mut self.tables, name, self.config, self.local_node)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> TableRegistry {
        let mut config = NodeConfig::default();
        config.data_path = dir.join("data");
        config.log_path = dir.join("log");
        config.db_sync_path = dir.join("dbsync");
        TableRegistry::new(Arc::new(config))
    }

    fn local() -> Node {
        Node::new("127.0.0.1", 9221)
    }

    #[test]
    fn test_get_or_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let a = registry.get_or_add_table("t");
        let b = registry.get_or_add_table("t");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all_table_names(), vec!["t".to_string()]);
    }

    #[test]
    fn test_key_routing_uses_partition_count() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let table = registry.get_or_add_table("t");
        table.set_partition_count(4);
        for id in 0..4 {
            table
                .update_or_add_partition(id, PartitionMapState::Active, local(), vec![])
                .unwrap();
        }

        let partition = registry.get_table_partition("t", b"some_key").unwrap();
        let expected = partition_for_key(b"some_key", 4);
        assert_eq!(partition.id(), expected);
    }

    #[test]
    fn test_leave_all_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let table = registry.get_or_add_table("t");
        table.set_partition_count(2);
        for id in 0..2 {
            table
                .update_or_add_partition(id, PartitionMapState::Active, local(), vec![])
                .unwrap();
        }

        assert_eq!(table.leave_all_partition(), vec![0, 1]);
        for partition in table.partitions() {
            assert_eq!(partition.state(), PartitionState::Leaving);
        }
    }

    #[test]
    fn test_dump_offsets_cover_all_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let table = registry.get_or_add_table("t");
        table.set_partition_count(3);
        for id in 0..3 {
            table
                .update_or_add_partition(id, PartitionMapState::Active, local(), vec![])
                .unwrap();
        }

        let offsets = registry.dump_binlog_offsets("");
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0].sync_offsets.len(), 3);
        assert_eq!(offsets[0].sync_offsets[2].partition, 2);
    }
}
