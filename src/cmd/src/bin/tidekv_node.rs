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

//! The data-node daemon. Config comes from an optional TOML file with
//! flag/env overrides on top; exits nonzero on any startup failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use thiserror_ext::AsReport;
use tidekv_common::config::NodeConfig;
use tidekv_common::error::Result;
use tidekv_node::DataServer;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tidekv-node", about = "TideKV data node", version)]
struct Opts {
    /// Path to a TOML config file.
    #[arg(long, env = "TIDEKV_CONFIG")]
    config: Option<PathBuf>,

    /// Meta quorum addresses, comma separated `ip:port` pairs.
    #[arg(long, env = "TIDEKV_META_ADDR", value_delimiter = ',')]
    meta_addr: Vec<String>,

    #[arg(long, env = "TIDEKV_LOCAL_IP")]
    local_ip: Option<String>,

    #[arg(long, env = "TIDEKV_LOCAL_PORT")]
    local_port: Option<u16>,

    #[arg(long, env = "TIDEKV_WORKER_NUM")]
    worker_num: Option<usize>,

    #[arg(long, env = "TIDEKV_DATA_PATH")]
    data_path: Option<PathBuf>,

    #[arg(long, env = "TIDEKV_LOG_PATH")]
    log_path: Option<PathBuf>,

    #[arg(long, env = "TIDEKV_DB_SYNC_PATH")]
    db_sync_path: Option<PathBuf>,
}

fn load_config(opts: &Opts) -> Result<NodeConfig> {
    let mut config = match &opts.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if !opts.meta_addr.is_empty() {
        config.meta_addr = opts.meta_addr.clone();
    }
    if let Some(local_ip) = &opts.local_ip {
        config.local_ip = local_ip.clone();
    }
    if let Some(local_port) = opts.local_port {
        config.local_port = local_port;
    }
    if let Some(worker_num) = opts.worker_num {
        config.worker_num = worker_num;
    }
    if let Some(data_path) = &opts.data_path {
        config.data_path = data_path.clone();
    }
    if let Some(log_path) = &opts.log_path {
        config.log_path = log_path.clone();
    }
    if let Some(db_sync_path) = &opts.db_sync_path {
        config.db_sync_path = db_sync_path.clone();
    }
    Ok(config)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tidekv_node=info,tidekv_storage=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let opts = Opts::parse();

    let config = match load_config(&opts) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e.as_report(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if config.meta_addr.is_empty() {
        tracing::error!("no meta address configured, set --meta-addr or TIDEKV_META_ADDR");
        return ExitCode::FAILURE;
    }

    let server = match DataServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e.as_report(), "startup failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        server.shutdown().await;
        return ExitCode::FAILURE;
    }
    tracing::info!("shutting down");
    server.shutdown().await;
    ExitCode::SUCCESS
}
