//! Meta node entry point: loads the JSON config, mounts the partitions
//! found under the metadata root, serves the wire protocol, and shuts
//! down gracefully on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use tidefs_metanode::{
    start_free_list_workers, start_snapshot_worker, start_vol_view_worker, LoopbackLog,
    MetaNodeService, MetadataManager, StaticDataView, TcpExtentDeleter,
};
use tidefs_transport::{ConnectPool, PoolConfig};

#[derive(Parser)]
#[command(name = "tidefs-metanode", about = "TideFS meta node")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Deserialize)]
struct NodeConfig {
    listen: String,
    metadata_dir: PathBuf,
    node_id: u64,
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

    let manager = match MetadataManager::new(&config.metadata_dir, config.node_id) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "meta node boot failed");
            process::exit(1);
        }
    };

    // Without a cluster controller attached, every local partition
    // directory is considered listed and boots single-replica.
    let listed: Vec<u64> = local_partition_ids(&config.metadata_dir);
    if let Err(e) = manager.load_partitions(&listed) {
        error!(error = %e, "partition load failed");
        process::exit(1);
    }

    let pool = Arc::new(ConnectPool::new(PoolConfig::default()));
    let data_view: Arc<StaticDataView> = Arc::new(StaticDataView::new());
    let view: Arc<dyn tidefs_metanode::DataPartitionView> = data_view;
    let deleter = Arc::new(TcpExtentDeleter::new(Arc::clone(&pool), Arc::clone(&view)));
    let (stop_tx, stop_rx) = watch::channel(false);
    pool.spawn_reaper(stop_rx.clone());
    start_vol_view_worker(view, stop_rx.clone());

    for partition in manager.partitions() {
        let log = Arc::new(LoopbackLog::new(Arc::downgrade(&partition)));
        partition.attach_log(log);
        if let Err(e) = partition.handle_leader_change(true) {
            error!(partition_id = partition.id(), error = %e, "leader init failed");
        }
        start_snapshot_worker(Arc::clone(&partition), stop_rx.clone());
        let worker_deleter: Arc<dyn tidefs_metanode::ExtentDeleter> = deleter.clone();
        start_free_list_workers(Arc::clone(&partition), worker_deleter, stop_rx.clone());
    }

    let service = Arc::new(MetaNodeService::new(manager));
    let listener = match TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "cannot bind");
            process::exit(1);
        }
    };
    info!(listen = %config.listen, "serving");

    let serving = Arc::clone(&service);
    let serve_stop = stop_rx.clone();
    let server = tokio::spawn(async move {
        serving.serve(listener, serve_stop).await;
    });

    wait_for_shutdown().await;
    info!("shutting down");
    let _ = stop_tx.send(true);
    service.manager().stop_all();
    let _ = server.await;
}

fn local_partition_ids(metadata_dir: &std::path::Path) -> Vec<u64> {
    let Ok(entries) = std::fs::read_dir(metadata_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("partition_")
                .and_then(|id| id.parse().ok())
        })
        .collect()
}

async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
