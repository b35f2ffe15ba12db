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

use tidekv_common::error::Result;
use tidekv_common::types::Node;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// One cached connection. Exposed so request/response exchanges hold the
/// per-connection lock for the whole round trip.
pub type PooledConn = Arc<Mutex<TcpStream>>;

/// Connections keyed by node, created lazily, dropped on the first
/// transport error and recreated on next use.
pub struct ConnectionPool {
    connect_timeout: Duration,
    conns: Mutex<HashMap<Node, PooledConn>>,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Any live connection, preferred over dialing when the target does not
    /// matter (meta commands go to whichever meta answers).
    pub async fn get_exist_connection(&self) -> Option<(Node, PooledConn)> {
        let conns = self.conns.lock().await;
        conns
            .iter()
            .next()
            .map(|(node, conn)| (node.clone(), conn.clone()))
    }

    pub async fn get_connection(&self, node: &Node) -> Result<PooledConn> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(node) {
            return Ok(conn.clone());
        }
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((node.ip.as_str(), node.port)),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {node} timed out"),
            )
        })??;
        let conn = Arc::new(Mutex::new(stream));
        conns.insert(node.clone(), conn.clone());
        Ok(conn)
    }

    pub async fn remove_connection(&self, node: &Node) {
        self.conns.lock().await.remove(node);
    }
}
