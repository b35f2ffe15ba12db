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

//! Client behavior against real data nodes and a scripted meta.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidekv_client::{Cluster, ClusterOptions};
use tidekv_common::config::NodeConfig;
use tidekv_common::types::Node;
use tidekv_node::test_utils::{pick_base_port, MockMeta};
use tidekv_node::DataServer;

const WAIT_DEADLINE: Duration = Duration::from_secs(15);

struct TestNode {
    server: Arc<DataServer>,
    node: Node,
    _dir: tempfile::TempDir,
}

async fn start_node(meta_addrs: &[String]) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let port = pick_base_port().await;
    let mut config = NodeConfig::default();
    config.local_ip = "127.0.0.1".to_string();
    config.local_port = port;
    config.meta_addr = meta_addrs.to_vec();
    config.worker_num = 2;
    config.binlog_receive_worker_num = 2;
    config.binlog_send_worker_num = 2;
    config.data_path = dir.path().join("data");
    config.log_path = dir.path().join("log");
    config.db_sync_path = dir.path().join("dbsync");
    config.binlog_file_size = 4096;
    config.ping_interval_ms = 100;
    config.trysync_interval_ms = 100;
    let server = DataServer::start(config).await.unwrap();
    TestNode {
        server,
        node: Node::new("127.0.0.1", port),
        _dir: dir,
    }
}

async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = Instant::now() + WAIT_DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn cluster(meta: &MockMeta) -> Cluster {
    Cluster::new(ClusterOptions {
        meta_addr: vec![meta.addr()],
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_ops_roundtrip() {
    let meta = MockMeta::start().await;
    let a = start_node(&[meta.addr()]).await;
    meta.set_table("t", vec![(0, a.node.clone(), vec![])]);

    let sa = a.server.clone();
    let target = meta.epoch();
    wait_until(|| sa.epoch() >= target, "map applied").await;

    let client = cluster(&meta);
    client.connect().await.unwrap();

    client.set("t", b"k", b"v1").await.unwrap();
    assert_eq!(client.get("t", b"k").await.unwrap(), Some(b"v1".to_vec()));
    client.delete("t", b"k").await.unwrap();
    assert_eq!(client.get("t", b"k").await.unwrap(), None);

    // The first key-op pulled the map and learned the epoch.
    assert_eq!(client.epoch(), meta.epoch());
    assert_eq!(client.cached_master("t", b"k"), Some(a.node.clone()));

    a.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admin_surface() {
    let meta = MockMeta::start().await;
    let a = start_node(&[meta.addr()]).await;
    meta.set_table("t", vec![(0, a.node.clone(), vec![])]);

    let client = cluster(&meta);
    client.create_table("t2", 4).await.unwrap();
    assert!(client.create_table("t2", 4).await.is_err());

    let mut tables = client.list_table().await.unwrap();
    tables.sort();
    assert_eq!(tables, vec!["t".to_string(), "t2".to_string()]);

    let other = Node::new("127.0.0.1", 10001);
    client.set_master("t2", 0, &a.node).await.unwrap();
    client.add_slave("t2", 0, &other).await.unwrap();
    client.pull("t2").await.unwrap();
    assert_eq!(client.cached_master("t2", b"k"), {
        let id = tidekv_common::hash::partition_for_key(b"k", 4);
        if id == 0 {
            Some(a.node.clone())
        } else {
            Some(Node::default())
        }
    });
    client.remove_slave("t2", 0, &other).await.unwrap();

    let (leader, followers) = client.list_meta().await.unwrap();
    assert!(!leader.is_empty());
    assert!(followers.is_empty());

    // The data node heartbeats, so it shows up in the node list.
    let sa = a.server.clone();
    wait_until(|| sa.epoch() >= 0, "node pinged").await;
    let nodes = client.list_node().await.unwrap();
    assert!(nodes.iter().any(|(node, up)| *node == a.node && *up));

    a.server.shutdown().await;
}

/// Scenario: the cached map is stale after a master move; the first answer
/// is a move hint, one retry against the hinted node succeeds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_on_stale_map() {
    let meta = MockMeta::start().await;
    let a = start_node(&[meta.addr()]).await;
    let b = start_node(&[meta.addr()]).await;
    meta.set_table("t", vec![(0, a.node.clone(), vec![b.node.clone()])]);

    let (sa, sb) = (a.server.clone(), b.server.clone());
    let target = meta.epoch();
    wait_until(
        || sa.epoch() >= target && sb.epoch() >= target,
        "map applied on both",
    )
    .await;

    let client = cluster(&meta);
    client.set("t", b"k", b"v1").await.unwrap();
    assert_eq!(client.cached_master("t", b"k"), Some(a.node.clone()));

    // Wait for the follower to hold v1 so the master move loses no data.
    let sb2 = b.server.clone();
    wait_until(
        || {
            sb2.registry
                .get_table_partition_by_id("t", 0)
                .map(|p| p.binlog_offset())
                == sa.registry
                    .get_table_partition_by_id("t", 0)
                    .map(|p| p.binlog_offset())
        },
        "follower caught up",
    )
    .await;

    meta.set_table("t", vec![(0, b.node.clone(), vec![a.node.clone()])]);
    let target = meta.epoch();
    wait_until(
        || sa.epoch() >= target && sb.epoch() >= target,
        "rotated map applied",
    )
    .await;

    // The client still believes in the old master; the write lands anyway.
    assert_eq!(client.cached_master("t", b"k"), Some(a.node.clone()));
    client.set("t", b"k", b"v2").await.unwrap();
    assert_eq!(client.cached_master("t", b"k"), Some(b.node.clone()));
    assert_eq!(client.get("t", b"k").await.unwrap(), Some(b"v2".to_vec()));

    a.server.shutdown().await;
    b.server.shutdown().await;
}

/// Scenario: the cached master is dead; a transport error triggers one
/// pull and the retry lands on the new master.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_after_master_death() {
    let meta = MockMeta::start().await;
    let a = start_node(&[meta.addr()]).await;
    let b = start_node(&[meta.addr()]).await;
    meta.set_table("t", vec![(0, a.node.clone(), vec![b.node.clone()])]);

    let (sa, sb) = (a.server.clone(), b.server.clone());
    let target = meta.epoch();
    wait_until(
        || sa.epoch() >= target && sb.epoch() >= target,
        "map applied on both",
    )
    .await;

    let client = cluster(&meta);
    client.set("t", b"k", b"v1").await.unwrap();
    let sb2 = b.server.clone();
    wait_until(
        || {
            sb2.registry
                .get_table_partition_by_id("t", 0)
                .map(|p| p.binlog_offset())
                == sa.registry
                    .get_table_partition_by_id("t", 0)
                    .map(|p| p.binlog_offset())
        },
        "follower caught up",
    )
    .await;

    a.server.shutdown().await;
    meta.set_table("t", vec![(0, b.node.clone(), vec![])]);
    let target = meta.epoch();
    wait_until(|| sb.epoch() >= target, "b promoted").await;

    client.set("t", b"k", b"v2").await.unwrap();
    assert_eq!(client.get("t", b"k").await.unwrap(), Some(b"v2".to_vec()));
    assert_eq!(client.cached_master("t", b"k"), Some(b.node.clone()));

    b.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_info_surface() {
    let meta = MockMeta::start().await;
    let a = start_node(&[meta.addr()]).await;
    meta.set_table("t", vec![(0, a.node.clone(), vec![])]);

    let sa = a.server.clone();
    let target = meta.epoch();
    wait_until(|| sa.epoch() >= target, "map applied").await;

    let client = cluster(&meta);
    for i in 0..50 {
        client
            .set("t", format!("k{i}").as_bytes(), b"some value")
            .await
            .unwrap();
    }

    let offsets = client.info_offset(&a.node, "t").await.unwrap();
    assert_eq!(offsets.len(), 1);
    assert_eq!(offsets[0].0, 0);
    assert!(offsets[0].1.offset > 0 || offsets[0].1.file_num > 0);

    let (_qps, total) = client.info_qps("t").await.unwrap();
    assert!(total >= 50);

    let spaces = client.info_space("t").await.unwrap();
    assert_eq!(spaces.len(), 1);
    assert!(spaces[0].1.used > 0);

    a.server.shutdown().await;
}
