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

//! The cluster handle. Key ops route through the cached partition map and
//! recover from staleness with at most one `PULL` per call; a `Move`
//! answer patches the cached entry directly and retries once.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tidekv_common::config::META_PORT_SHIFT_CMD;
use tidekv_common::error::{Error, Result};
use tidekv_common::hash::partition_for_key;
use tidekv_common::types::{BinlogOffset, Node};
use tidekv_proto::client::{
    cmd_request, cmd_response, CmdRequest, CmdResponse, DelRequest, GetRequest, InfoRequest,
    SetRequest,
};
use tidekv_proto::codec::{read_message, write_message};
use tidekv_proto::common::{PbNode, StatusCode};
use tidekv_proto::meta::{
    meta_cmd, meta_cmd_response, BasicArgs, InitRequest, ListArgs, MetaCmd, MetaCmdResponse,
    PullRequest, PullResponse,
};

use crate::pool::ConnectionPool;

/// Bounded transport retries against the same data master; only a map
/// update shifts the target.
pub const DATA_ATTEMPT: usize = 2;
/// Bounded transport retries for meta commands, rotating through the
/// configured metas.
pub const META_ATTEMPT: usize = 3;

#[derive(Clone, Debug)]
pub struct ClusterOptions {
    /// Meta quorum addresses, `ip:port` each (base port, not the command
    /// channel).
    pub meta_addr: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            meta_addr: vec![],
            connect_timeout_ms: 1500,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct CachedPartition {
    master: Node,
    slaves: Vec<Node>,
}

#[derive(Clone, Debug, Default)]
struct CachedTable {
    partition_count: u32,
    partitions: HashMap<u32, CachedPartition>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub used: u64,
    pub remain: u64,
}

pub struct Cluster {
    meta_addrs: Vec<Node>,
    meta_pool: ConnectionPool,
    data_pool: ConnectionPool,
    epoch: Mutex<i64>,
    tables: Mutex<HashMap<String, CachedTable>>,
}

impl Cluster {
    pub fn new(options: ClusterOptions) -> Result<Self> {
        let meta_addrs: Vec<Node> = options
            .meta_addr
            .iter()
            .map(|addr| addr.parse())
            .collect::<Result<_>>()?;
        if meta_addrs.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one meta address is required".to_string(),
            ));
        }
        let connect_timeout = Duration::from_millis(options.connect_timeout_ms);
        Ok(Self {
            meta_addrs,
            meta_pool: ConnectionPool::new(connect_timeout),
            data_pool: ConnectionPool::new(connect_timeout),
            epoch: Mutex::new(0),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn epoch(&self) -> i64 {
        *self.epoch.lock()
    }

    /// The cached master for a key, if the table has been pulled.
    pub fn cached_master(&self, table: &str, key: &[u8]) -> Option<Node> {
        let tables = self.tables.lock();
        let cached = tables.get(table)?;
        if cached.partition_count == 0 {
            return None;
        }
        let id = partition_for_key(key, cached.partition_count);
        cached.partitions.get(&id).map(|p| p.master.clone())
    }

    /// Verifies that some meta is reachable.
    pub async fn connect(&self) -> Result<()> {
        self.meta_connection().await.map(|_| ())
    }

    pub async fn set(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::Set(SetRequest {
                table_name: table.to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
            })),
        };
        let response = self.submit_data_cmd(table, key, request).await?;
        match response.code() {
            StatusCode::Ok => Ok(()),
            _ => Err(response_error(response)),
        }
    }

    pub async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::Get(GetRequest {
                table_name: table.to_string(),
                key: key.to_vec(),
            })),
        };
        let response = self.submit_data_cmd(table, key, request).await?;
        match response.code() {
            StatusCode::Ok => match response.payload {
                Some(cmd_response::Payload::Get(get)) => Ok(Some(get.value)),
                _ => Err(Error::Corruption("get answer without value".to_string())),
            },
            StatusCode::NotFound => Ok(None),
            _ => Err(response_error(response)),
        }
    }

    pub async fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::Del(DelRequest {
                table_name: table.to_string(),
                key: key.to_vec(),
            })),
        };
        let response = self.submit_data_cmd(table, key, request).await?;
        match response.code() {
            StatusCode::Ok => Ok(()),
            _ => Err(response_error(response)),
        }
    }

    /// Downloads one table's map (or all tables for an empty name) and
    /// refreshes the cache.
    pub async fn pull(&self, table: &str) -> Result<()> {
        let request = MetaCmd {
            cmd: Some(meta_cmd::Cmd::Pull(PullRequest {
                node: None,
                table_name: table.to_string(),
            })),
        };
        let response = self.submit_meta_cmd(request).await?;
        if !response.ok() {
            return Err(Error::Internal(anyhow_msg(&response.msg)));
        }
        let pull = match response.payload {
            Some(meta_cmd_response::Payload::Pull(pull)) => pull,
            _ => return Err(Error::Corruption("pull answer without map".to_string())),
        };
        self.apply_pull(pull);
        Ok(())
    }

    fn apply_pull(&self, pull: PullResponse) {
        {
            let mut epoch = self.epoch.lock();
            *epoch = (*epoch).max(pull.version);
        }
        let mut tables = self.tables.lock();
        for table_map in pull.tables {
            let mut cached = CachedTable {
                partition_count: table_map.partitions.len() as u32,
                partitions: HashMap::new(),
            };
            for entry in table_map.partitions {
                cached.partitions.insert(
                    entry.id,
                    CachedPartition {
                        master: entry.master.as_ref().map(Node::from).unwrap_or_default(),
                        slaves: entry.slaves.iter().map(Node::from).collect(),
                    },
                );
            }
            tables.insert(table_map.name, cached);
        }
    }

    async fn data_master(&self, table: &str, key: &[u8]) -> Result<Node> {
        if self.cached_master(table, key).is_none() {
            self.pull(table).await?;
        }
        let master = self
            .cached_master(table, key)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))?;
        if master.is_empty() {
            return Err(Error::Unavailable(format!(
                "no master assigned for key in table {table}"
            )));
        }
        Ok(master)
    }

    /// One key-op round: route by the cached map, then recover once from a
    /// move hint and once from a stale map before surfacing the outcome.
    async fn submit_data_cmd(
        &self,
        table: &str,
        key: &[u8],
        request: CmdRequest,
    ) -> Result<CmdResponse> {
        let mut pulled = false;
        let mut moved = false;
        loop {
            let master = self.data_master(table, key).await?;
            match self.try_data_rpc(&master, &request).await {
                Ok(response) => match response.code() {
                    StatusCode::Move if !moved => {
                        let Some(hint) = response.redirect.as_ref().map(Node::from) else {
                            return Ok(response);
                        };
                        tracing::debug!(table, master = %hint, "following move hint");
                        self.patch_master(table, key, hint);
                        moved = true;
                    }
                    StatusCode::Error | StatusCode::Wait if !pulled => {
                        self.pull(table).await?;
                        pulled = true;
                    }
                    _ => return Ok(response),
                },
                Err(e) if !pulled => {
                    tracing::debug!(table, error = %e, "data rpc failed, refreshing map");
                    self.pull(table).await?;
                    pulled = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn patch_master(&self, table: &str, key: &[u8], master: Node) {
        let mut tables = self.tables.lock();
        if let Some(cached) = tables.get_mut(table) {
            if cached.partition_count > 0 {
                let id = partition_for_key(key, cached.partition_count);
                cached.partitions.entry(id).or_default().master = master;
            }
        }
    }

    /// Data RPCs retry only against the same master; shifting the target is
    /// the map's job.
    async fn try_data_rpc(&self, node: &Node, request: &CmdRequest) -> Result<CmdResponse> {
        let mut last = None;
        for _ in 0..DATA_ATTEMPT {
            let conn = match self.data_pool.get_connection(node).await {
                Ok(conn) => conn,
                Err(e) => {
                    last = Some(e);
                    continue;
                }
            };
            let mut stream = conn.lock().await;
            let result: Result<Option<CmdResponse>> = async {
                write_message(&mut *stream, request).await?;
                read_message(&mut *stream).await
            }
            .await;
            match result {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {
                    drop(stream);
                    self.data_pool.remove_connection(node).await;
                    last = Some(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{node} closed the connection"),
                    )));
                }
                Err(e) => {
                    drop(stream);
                    self.data_pool.remove_connection(node).await;
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Unavailable(format!("no connection to {node}"))))
    }

    async fn meta_connection(&self) -> Result<(Node, crate::pool::PooledConn)> {
        if let Some(existing) = self.meta_pool.get_exist_connection().await {
            return Ok(existing);
        }
        // Start at a random index so clients spread load across metas.
        let start = rand::thread_rng().gen_range(0..self.meta_addrs.len());
        let mut last = None;
        for i in 0..self.meta_addrs.len() {
            let meta = &self.meta_addrs[(start + i) % self.meta_addrs.len()];
            let cmd_node = Node::new(meta.ip.clone(), meta.port + META_PORT_SHIFT_CMD);
            match self.meta_pool.get_connection(&cmd_node).await {
                Ok(conn) => return Ok((cmd_node, conn)),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Unavailable("no meta reachable".to_string())))
    }

    async fn submit_meta_cmd(&self, request: MetaCmd) -> Result<MetaCmdResponse> {
        let mut last = None;
        for _ in 0..META_ATTEMPT {
            let (node, conn) = match self.meta_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    last = Some(e);
                    continue;
                }
            };
            let mut stream = conn.lock().await;
            let result: Result<Option<MetaCmdResponse>> = async {
                write_message(&mut *stream, &request).await?;
                read_message(&mut *stream).await
            }
            .await;
            match result {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {
                    drop(stream);
                    self.meta_pool.remove_connection(&node).await;
                    last = Some(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "meta closed the connection".to_string(),
                    )));
                }
                Err(e) => {
                    drop(stream);
                    self.meta_pool.remove_connection(&node).await;
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Unavailable("no meta reachable".to_string())))
    }

    async fn submit_meta_ok(&self, request: MetaCmd) -> Result<MetaCmdResponse> {
        let response = self.submit_meta_cmd(request).await?;
        if !response.ok() {
            return Err(Error::Internal(anyhow_msg(&response.msg)));
        }
        Ok(response)
    }

    pub async fn create_table(&self, table: &str, partition_num: u32) -> Result<()> {
        self.submit_meta_ok(MetaCmd {
            cmd: Some(meta_cmd::Cmd::Init(InitRequest {
                table_name: table.to_string(),
                partition_num,
            })),
        })
        .await
        .map(|_| ())
    }

    pub async fn set_master(&self, table: &str, partition: u32, node: &Node) -> Result<()> {
        self.basic_meta_cmd(table, partition, node, meta_cmd::Cmd::SetMaster)
            .await
    }

    pub async fn add_slave(&self, table: &str, partition: u32, node: &Node) -> Result<()> {
        self.basic_meta_cmd(table, partition, node, meta_cmd::Cmd::AddSlave)
            .await
    }

    pub async fn remove_slave(&self, table: &str, partition: u32, node: &Node) -> Result<()> {
        self.basic_meta_cmd(table, partition, node, meta_cmd::Cmd::RemoveSlave)
            .await
    }

    async fn basic_meta_cmd(
        &self,
        table: &str,
        partition: u32,
        node: &Node,
        build: fn(BasicArgs) -> meta_cmd::Cmd,
    ) -> Result<()> {
        self.submit_meta_ok(MetaCmd {
            cmd: Some(build(BasicArgs {
                table_name: table.to_string(),
                partition,
                node: Some(PbNode::from(node)),
            })),
        })
        .await
        .map(|_| ())
    }

    pub async fn list_meta(&self) -> Result<(Node, Vec<Node>)> {
        let response = self
            .submit_meta_ok(MetaCmd {
                cmd: Some(meta_cmd::Cmd::ListMeta(ListArgs {})),
            })
            .await?;
        match response.payload {
            Some(meta_cmd_response::Payload::ListMeta(list)) => Ok((
                list.leader.as_ref().map(Node::from).unwrap_or_default(),
                list.followers.iter().map(Node::from).collect(),
            )),
            _ => Err(Error::Corruption("list-meta answer malformed".to_string())),
        }
    }

    pub async fn list_node(&self) -> Result<Vec<(Node, bool)>> {
        let response = self
            .submit_meta_ok(MetaCmd {
                cmd: Some(meta_cmd::Cmd::ListNode(ListArgs {})),
            })
            .await?;
        match response.payload {
            Some(meta_cmd_response::Payload::ListNode(list)) => Ok(list
                .nodes
                .iter()
                .map(|status| {
                    (
                        status.node.as_ref().map(Node::from).unwrap_or_default(),
                        status.status == 0,
                    )
                })
                .collect()),
            _ => Err(Error::Corruption("list-node answer malformed".to_string())),
        }
    }

    pub async fn list_table(&self) -> Result<Vec<String>> {
        let response = self
            .submit_meta_ok(MetaCmd {
                cmd: Some(meta_cmd::Cmd::ListTable(ListArgs {})),
            })
            .await?;
        match response.payload {
            Some(meta_cmd_response::Payload::ListTable(list)) => Ok(list.tables),
            _ => Err(Error::Corruption("list-table answer malformed".to_string())),
        }
    }

    /// Sums qps and total queries for a table across its related nodes.
    pub async fn info_qps(&self, table: &str) -> Result<(u64, u64)> {
        self.pull(table).await?;
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::InfoStats(InfoRequest {
                table_name: table.to_string(),
            })),
        };
        let mut qps = 0;
        let mut total = 0;
        for node in self.related_nodes(table) {
            let Ok(response) = self.try_data_rpc(&node, &request).await else {
                continue;
            };
            if let Some(cmd_response::Payload::InfoStats(info)) = response.payload {
                for stats in info.info_stats {
                    if stats.table_name == table {
                        qps += stats.qps;
                        total += stats.total_queries;
                    }
                }
            }
        }
        Ok((qps, total))
    }

    /// Binlog offsets of one node's partitions of a table.
    pub async fn info_offset(&self, node: &Node, table: &str) -> Result<Vec<(u32, BinlogOffset)>> {
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::InfoPartition(InfoRequest {
                table_name: table.to_string(),
            })),
        };
        let response = self.try_data_rpc(node, &request).await?;
        let mut offsets = vec![];
        if let Some(cmd_response::Payload::InfoPartition(info)) = response.payload {
            for table_offsets in info.info_partition {
                if table_offsets.table_name != table {
                    continue;
                }
                for entry in table_offsets.sync_offsets {
                    offsets.push((entry.partition, entry.binlog_offset()));
                }
            }
        }
        Ok(offsets)
    }

    /// Used/remaining space per related node of a table.
    pub async fn info_space(&self, table: &str) -> Result<Vec<(Node, SpaceInfo)>> {
        self.pull(table).await?;
        let request = CmdRequest {
            cmd: Some(cmd_request::Cmd::InfoCapacity(InfoRequest {
                table_name: table.to_string(),
            })),
        };
        let mut spaces = vec![];
        for node in self.related_nodes(table) {
            let Ok(response) = self.try_data_rpc(&node, &request).await else {
                continue;
            };
            if let Some(cmd_response::Payload::InfoCapacity(info)) = response.payload {
                for capacity in info.info_capacity {
                    if capacity.table_name == table {
                        spaces.push((
                            node.clone(),
                            SpaceInfo {
                                used: capacity.used,
                                remain: capacity.remain,
                            },
                        ));
                    }
                }
            }
        }
        Ok(spaces)
    }

    fn related_nodes(&self, table: &str) -> Vec<Node> {
        let tables = self.tables.lock();
        let Some(cached) = tables.get(table) else {
            return vec![];
        };
        let mut nodes: Vec<Node> = cached
            .partitions
            .values()
            .flat_map(|p| std::iter::once(p.master.clone()).chain(p.slaves.iter().cloned()))
            .filter(|n| !n.is_empty())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

fn response_error(response: CmdResponse) -> Error {
    match response.code() {
        StatusCode::NotFound => Error::NotFound(response.msg),
        StatusCode::Wait => Error::Unavailable(response.msg),
        StatusCode::Move => Error::NotLeader {
            master: response.redirect.as_ref().map(Node::from).unwrap_or_default(),
        },
        _ => Error::Internal(anyhow_msg(&response.msg)),
    }
}

fn anyhow_msg(msg: &str) -> anyhow::Error {
    anyhow::anyhow!("{msg}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_meta_addr() {
        assert!(Cluster::new(ClusterOptions::default()).is_err());
        assert!(Cluster::new(ClusterOptions {
            meta_addr: vec!["127.0.0.1:9100".to_string()],
            ..Default::default()
        })
        .is_ok());
        assert!(Cluster::new(ClusterOptions {
            meta_addr: vec!["localhost".to_string()],
            ..Default::default()
        })
        .is_err());
    }
}
