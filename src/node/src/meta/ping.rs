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

use std::sync::Arc;
use std::time::Duration;

use thiserror_ext::AsReport;
use tidekv_common::config::META_PORT_SHIFT_CMD;
use tidekv_common::error::{Error, Result};
use tidekv_common::types::Node;
use tidekv_proto::codec::{read_message, write_message};
use tidekv_proto::common::PbNode;
use tidekv_proto::meta::{meta_cmd, meta_cmd_response, MetaCmd, MetaCmdResponse, PingRequest};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::server::DataServer;

/// Heartbeat loop. This is the only place the current meta is selected:
/// when none is selected, one is picked uniformly at random, and any
/// transport error deselects it so the next tick picks again. The ping
/// carries the local epoch and all partition offsets; an epoch mismatch in
/// the answer wakes the meta-pull worker.
pub async fn run_ping(server: Arc<DataServer>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(server.config().ping_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut conn: Option<TcpStream> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let Some(meta) = server.meta_target().or_else(|| server.pick_meta()) else {
            continue;
        };
        match ping_once(&server, &mut conn, &meta).await {
            Ok(remote_epoch) => {
                server.try_update_epoch(remote_epoch);
            }
            Err(e) => {
                tracing::warn!(meta = %meta, error = %e.as_report(), "ping failed");
                conn = None;
                server.clear_meta_target();
            }
        }
    }
}

async fn ping_once(
    server: &Arc<DataServer>,
    conn: &mut Option<TcpStream>,
    meta: &Node,
) -> Result<i64> {
    let config = server.config();
    let cmd_port = meta.port + META_PORT_SHIFT_CMD;
    if conn.is_none() {
        let stream = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect((meta.ip.as_str(), cmd_port)),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to meta {meta} timed out"),
            ))
        })??;
        *conn = Some(stream);
    }
    let stream = conn.as_mut().unwrap();

    let request = MetaCmd {
        cmd: Some(meta_cmd::Cmd::Ping(PingRequest {
            node: Some(PbNode::from(&server.local_node())),
            epoch: server.epoch(),
            offsets: server.registry.dump_binlog_offsets(""),
        })),
    };
    let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms);
    tokio::time::timeout(rpc_timeout, write_message(stream, &request))
        .await
        .map_err(|_| timeout_error(meta))??;
    let response: MetaCmdResponse = tokio::time::timeout(rpc_timeout, read_message(stream))
        .await
        .map_err(|_| timeout_error(meta))??
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "meta closed the connection",
            ))
        })?;

    if !response.ok() {
        return Err(Error::Internal(anyhow::anyhow!(
            "meta rejected ping: {}",
            response.msg
        )));
    }
    match response.payload {
        Some(meta_cmd_response::Payload::Ping(ping)) => Ok(ping.epoch),
        _ => Err(Error::Corruption("ping answer without epoch".to_string())),
    }
}

fn timeout_error(meta: &Node) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("ping to meta {meta} timed out"),
    ))
}
