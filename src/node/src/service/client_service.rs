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

//! Client-facing service: the acceptor assigns each connection to one of
//! `worker_num` workers round-robin; a connection's requests are handled
//! strictly in arrival order.

use std::sync::Arc;

use prost::Message;
use tidekv_proto::client::CmdRequest;
use tidekv_proto::codec::{read_message, write_message};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::command;
use crate::server::DataServer;
use crate::stats::WorkerStats;

pub async fn run_dispatcher(
    server: Arc<DataServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_worker = 0usize;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, worker = next_worker, "client connected");
                        let worker = server.stats.worker(next_worker);
                        next_worker = next_worker.wrapping_add(1);
                        tokio::spawn(handle_connection(
                            server.clone(),
                            stream,
                            worker,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "client accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    server: Arc<DataServer>,
    mut stream: TcpStream,
    worker: Arc<WorkerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request: CmdRequest = tokio::select! {
            _ = shutdown.changed() => break,
            request = read_message(&mut stream) => match request {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed client request, closing");
                    break;
                }
            }
        };

        if let Some(cmd) = &request.cmd {
            let table = command::table_name(cmd);
            if !table.is_empty() {
                worker.record(table, request.encoded_len() as u64);
            }
        }

        let response = command::dispatch(&server, request);
        if let Err(e) = write_message(&mut stream, &response).await {
            tracing::debug!(error = %e, "client write failed, closing");
            break;
        }
    }
}
