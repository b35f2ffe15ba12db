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

//! Test support: an in-process mock of the meta command channel with a
//! scripted partition map. Placement logic stays out of scope; tests drive
//! the map explicitly and the mock answers `PING`/`PULL` and the admin
//! commands against it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tidekv_common::config::META_PORT_SHIFT_CMD;
use tidekv_common::types::Node;
use tidekv_proto::codec::{read_message, write_message};
use tidekv_proto::common::{PbNode, StatusCode};
use tidekv_proto::meta::{
    meta_cmd, meta_cmd_response, ListMetaResponse, ListNodeResponse, ListTableResponse, MetaCmd,
    MetaCmdResponse, NodeStatus, PartitionMap, PartitionMapState, PingResponse, PullResponse,
    TableMap,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MetaMapState {
    epoch: i64,
    tables: Vec<TableMap>,
    seen_nodes: HashSet<Node>,
}

/// A scripted meta node. Binds only the command channel; the advertised
/// base address is derived backwards from it.
pub struct MockMeta {
    node: Node,
    state: Arc<Mutex<MetaMapState>>,
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl MockMeta {
    pub async fn start() -> Self {
        let listener = loop {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            if listener.local_addr().unwrap().port() > META_PORT_SHIFT_CMD {
                break listener;
            }
        };
        Self::serve(listener).await
    }

    /// Binds the command channel at a specific port; used to bring a meta
    /// "back up" at an address data nodes already know.
    pub async fn start_at(cmd_port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", cmd_port)).await.unwrap();
        Self::serve(listener).await
    }

    async fn serve(listener: TcpListener) -> Self {
        let cmd_port = listener.local_addr().unwrap().port();
        let node = Node::new("127.0.0.1", cmd_port - META_PORT_SHIFT_CMD);
        let state = Arc::new(Mutex::new(MetaMapState::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let serve_state = state.clone();
        let serve_node = node.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_conn(
                    stream,
                    serve_state.clone(),
                    serve_node.clone(),
                    shutdown_rx.clone(),
                ));
            }
        });

        Self {
            node,
            state,
            handle,
            shutdown,
        }
    }

    /// The address data nodes and clients put in `meta_addr`.
    pub fn addr(&self) -> String {
        self.node.to_string()
    }

    pub fn epoch(&self) -> i64 {
        self.state.lock().epoch
    }

    pub fn cmd_port(&self) -> u16 {
        self.node.port + META_PORT_SHIFT_CMD
    }

    /// Fast-forwards the epoch, e.g. when standing in for a meta that came
    /// back after an outage.
    pub fn set_epoch(&self, epoch: i64) {
        self.state.lock().epoch = epoch;
    }

    /// Replaces one table's map and bumps the epoch.
    pub fn set_table(&self, name: &str, partitions: Vec<(u32, Node, Vec<Node>)>) {
        let mut state = self.state.lock();
        state.tables.retain(|t| t.name != name);
        state.tables.push(TableMap {
            name: name.to_string(),
            partitions: partitions
                .into_iter()
                .map(|(id, master, slaves)| PartitionMap {
                    id,
                    state_raw: PartitionMapState::Active as i32,
                    master: Some(PbNode::from(&master)),
                    slaves: slaves.iter().map(PbNode::from).collect(),
                })
                .collect(),
        });
        state.epoch += 1;
    }

    /// Drops a table from the map entirely and bumps the epoch.
    pub fn drop_table(&self, name: &str) {
        let mut state = self.state.lock();
        state.tables.retain(|t| t.name != name);
        state.epoch += 1;
    }

    /// Kills the accept loop and every open connection, releasing the
    /// command port.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

impl Drop for MockMeta {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    state: Arc<Mutex<MetaMapState>>,
    meta_node: Node,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request: MetaCmd = tokio::select! {
            _ = shutdown.changed() => break,
            request = read_message(&mut stream) => match request {
                Ok(Some(request)) => request,
                _ => break,
            }
        };
        let response = answer(request, &state, &meta_node);
        if write_message(&mut stream, &response).await.is_err() {
            break;
        }
    }
}

fn ok_with(payload: meta_cmd_response::Payload) -> MetaCmdResponse {
    MetaCmdResponse {
        code_raw: StatusCode::Ok as i32,
        msg: String::new(),
        payload: Some(payload),
    }
}

fn answer(request: MetaCmd, state: &Arc<Mutex<MetaMapState>>, meta_node: &Node) -> MetaCmdResponse {
    let Some(cmd) = request.cmd else {
        return MetaCmdResponse {
            code_raw: StatusCode::Error as i32,
            msg: "unknown meta command".to_string(),
            payload: None,
        };
    };
    let mut state = state.lock();
    match cmd {
        meta_cmd::Cmd::Ping(ping) => {
            if let Some(node) = ping.node.as_ref() {
                state.seen_nodes.insert(Node::from(node));
            }
            ok_with(meta_cmd_response::Payload::Ping(PingResponse {
                epoch: state.epoch,
            }))
        }
        meta_cmd::Cmd::Pull(pull) => {
            let tables = state
                .tables
                .iter()
                .filter(|t| pull.table_name.is_empty() || t.name == pull.table_name)
                .cloned()
                .collect();
            ok_with(meta_cmd_response::Payload::Pull(PullResponse {
                version: state.epoch,
                tables,
            }))
        }
        meta_cmd::Cmd::Init(init) => {
            if state.tables.iter().any(|t| t.name == init.table_name) {
                return MetaCmdResponse {
                    code_raw: StatusCode::Error as i32,
                    msg: "table already exists".to_string(),
                    payload: None,
                };
            }
            state.tables.push(TableMap {
                name: init.table_name,
                partitions: (0..init.partition_num)
                    .map(|id| PartitionMap {
                        id,
                        state_raw: PartitionMapState::Active as i32,
                        master: Some(PbNode::default()),
                        slaves: vec![],
                    })
                    .collect(),
            });
            state.epoch += 1;
            MetaCmdResponse {
                code_raw: StatusCode::Ok as i32,
                ..Default::default()
            }
        }
        meta_cmd::Cmd::SetMaster(args) => {
            let node = args.node.as_ref().map(Node::from).unwrap_or_default();
            let Some(entry) = state
                .tables
                .iter_mut()
                .find(|t| t.name == args.table_name)
                .and_then(|t| t.partitions.iter_mut().find(|p| p.id == args.partition))
            else {
                return MetaCmdResponse {
                    code_raw: StatusCode::NotFound as i32,
                    msg: "no such partition".to_string(),
                    payload: None,
                };
            };
            let old_master = entry.master.as_ref().map(Node::from).unwrap_or_default();
            entry.slaves.retain(|s| Node::from(s) != node);
            if !old_master.is_empty() && old_master != node {
                entry.slaves.push(PbNode::from(&old_master));
            }
            entry.master = Some(PbNode::from(&node));
            state.epoch += 1;
            MetaCmdResponse {
                code_raw: StatusCode::Ok as i32,
                ..Default::default()
            }
        }
        meta_cmd::Cmd::AddSlave(args) => {
            let node = args.node.as_ref().map(Node::from).unwrap_or_default();
            if let Some(entry) = state
                .tables
                .iter_mut()
                .find(|t| t.name == args.table_name)
                .and_then(|t| t.partitions.iter_mut().find(|p| p.id == args.partition))
            {
                if !entry.slaves.iter().any(|s| Node::from(s) == node) {
                    entry.slaves.push(PbNode::from(&node));
                }
            }
            state.epoch += 1;
            MetaCmdResponse {
                code_raw: StatusCode::Ok as i32,
                ..Default::default()
            }
        }
        meta_cmd::Cmd::RemoveSlave(args) => {
            let node = args.node.as_ref().map(Node::from).unwrap_or_default();
            if let Some(entry) = state
                .tables
                .iter_mut()
                .find(|t| t.name == args.table_name)
                .and_then(|t| t.partitions.iter_mut().find(|p| p.id == args.partition))
            {
                entry.slaves.retain(|s| Node::from(s) != node);
            }
            state.epoch += 1;
            MetaCmdResponse {
                code_raw: StatusCode::Ok as i32,
                ..Default::default()
            }
        }
        meta_cmd::Cmd::ListMeta(_) => ok_with(meta_cmd_response::Payload::ListMeta(
            ListMetaResponse {
                leader: Some(PbNode::from(meta_node)),
                followers: vec![],
            },
        )),
        meta_cmd::Cmd::ListNode(_) => {
            let mut nodes: Vec<Node> = state.seen_nodes.iter().cloned().collect();
            nodes.sort();
            ok_with(meta_cmd_response::Payload::ListNode(ListNodeResponse {
                nodes: nodes
                    .iter()
                    .map(|node| NodeStatus {
                        node: Some(PbNode::from(node)),
                        status: 0,
                    })
                    .collect(),
            }))
        }
        meta_cmd::Cmd::ListTable(_) => ok_with(meta_cmd_response::Payload::ListTable(
            ListTableResponse {
                tables: state.tables.iter().map(|t| t.name.clone()).collect(),
            },
        )),
    }
}

/// Picks a client port whose derived sync and rsync ports are also free.
pub async fn pick_base_port() -> u16 {
    use tidekv_common::config::{PORT_SHIFT_RSYNC, PORT_SHIFT_SYNC};
    loop {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        if port.checked_add(PORT_SHIFT_RSYNC).is_none() {
            continue;
        }
        drop(probe);
        let sync_free = TcpListener::bind(("127.0.0.1", port + PORT_SHIFT_SYNC))
            .await
            .is_ok();
        let rsync_free = TcpListener::bind(("127.0.0.1", port + PORT_SHIFT_RSYNC))
            .await
            .is_ok();
        if sync_free && rsync_free {
            return port;
        }
    }
}
