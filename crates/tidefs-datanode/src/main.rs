//! Data node entry point: loads the JSON config, mounts disks, serves
//! the wire protocol, and shuts down gracefully on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use tidefs_datanode::{DataNode, DataNodeConfig, StaticClusterView};

#[derive(Parser)]
#[command(name = "tidefs-datanode", about = "TideFS data node")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Deserialize)]
struct DiskConfig {
    path: PathBuf,
    capacity: u64,
}

#[derive(Deserialize)]
struct NodeConfig {
    listen: String,
    local_addr: String,
    disks: Vec<DiskConfig>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let raw = match std::fs::read(&args.config) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "cannot read config");
            process::exit(1);
        }
    };
    let config: NodeConfig = match serde_json::from_slice(&raw) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot parse config");
            process::exit(1);
        }
    };

    let cluster = Arc::new(StaticClusterView::new(config.local_addr.clone()));
    let node = match DataNode::start(
        DataNodeConfig {
            local_addr: config.local_addr,
            disks: config
                .disks
                .into_iter()
                .map(|d| (d.path, d.capacity))
                .collect(),
        },
        cluster,
    ) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "data node boot failed");
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "cannot bind");
            process::exit(1);
        }
    };
    info!(listen = %config.listen, "serving");

    let serving = Arc::clone(&node);
    let server = tokio::spawn(async move {
        serving.serve(listener).await;
    });

    wait_for_shutdown().await;
    info!("shutting down");
    node.shutdown();
    let _ = server.await;
}

async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
