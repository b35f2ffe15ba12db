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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tidekv_common::config::PORT_SHIFT_SYNC;
use tidekv_common::error::Result;
use tidekv_common::types::Node;
use tidekv_proto::client::ReplicateRequest;
use tidekv_proto::codec::write_message;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// The replication ingress endpoint of a peer data node.
pub fn sync_endpoint(node: &Node) -> Node {
    Node::new(node.ip.clone(), node.port + PORT_SHIFT_SYNC)
}

/// Outgoing replication connections, one per peer, created lazily and
/// dropped on the first send failure. Holding a per-connection lock across
/// the whole frame write keeps frames from interleaving when several send
/// tasks share a peer.
pub struct PeerPool {
    connect_timeout: Duration,
    conns: Mutex<HashMap<Node, Arc<Mutex<TcpStream>>>>,
}

impl PeerPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            conns: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, peer: &Node) -> Result<Arc<Mutex<TcpStream>>> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(peer) {
            return Ok(conn.clone());
        }
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((peer.ip.as_str(), peer.port)),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {peer} timed out"),
            )
        })??;
        let conn = Arc::new(Mutex::new(stream));
        conns.insert(peer.clone(), conn.clone());
        Ok(conn)
    }

    pub async fn send(&self, peer: &Node, frame: &ReplicateRequest) -> Result<()> {
        let conn = self.connection(peer).await?;
        let mut stream = conn.lock().await;
        match write_message(&mut *stream, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(stream);
                self.remove(peer).await;
                Err(e)
            }
        }
    }

    pub async fn remove(&self, peer: &Node) {
        self.conns.lock().await.remove(peer);
    }

    pub async fn close_all(&self) {
        self.conns.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_endpoint() {
        let node = Node::new("10.0.0.1", 9221);
        assert_eq!(
            sync_endpoint(&node),
            Node::new("10.0.0.1", 9221 + PORT_SHIFT_SYNC)
        );
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        // A port nothing listens on.
        let pool = PeerPool::new(Duration::from_millis(200));
        let peer = Node::new("127.0.0.1", 1);
        assert!(pool
            .send(&peer, &ReplicateRequest::default())
            .await
            .is_err());
        assert!(pool.conns.lock().await.is_empty());
    }
}
