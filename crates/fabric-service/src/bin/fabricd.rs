// SPDX-License-Identifier: Apache-2.0
//! Daemon entry point: resolves configuration, restores the last checkpoint,
//! then runs the debounced persistence ticker (and, if enabled, the mesh
//! relay's heartbeat/relay tickers) until signaled to shut down.

use std::time::Duration;

use clap::Parser;
use fabric_config_fs::FsConfigStore;
use fabric_service::config::ConfigResolver;
use fabric_service::coordinator::Coordinator;
use tracing::{error, info};

/// Polyglot execution fabric daemon.
#[derive(Parser, Debug)]
#[command(name = "fabricd", version, about)]
struct Args {
    /// Skip loading overrides from the platform config store.
    #[arg(long)]
    no_config_store: bool,

    /// Enable the peer mesh relay's heartbeat and relay background tasks.
    #[arg(long)]
    enable_mesh: bool,

    /// How often to check for a due checkpoint write, in milliseconds.
    #[arg(long, default_value_t = 250)]
    tick_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = if args.no_config_store {
        ConfigResolver::empty()
    } else {
        match FsConfigStore::new() {
            Ok(store) => ConfigResolver::from_store(&store),
            Err(err) => {
                error!(error = %err, "failed to open config store, falling back to defaults");
                ConfigResolver::empty()
            }
        }
    };

    let coordinator = Coordinator::new(&config, args.enable_mesh);

    match coordinator.restore() {
        Ok(count) => info!(restored = count, "startup restore complete"),
        Err(err) => error!(error = %err, "startup restore failed, continuing with empty state"),
    }

    let tick_interval = Duration::from_millis(args.tick_interval_ms);
    let mut ticker = tokio::time::interval(tick_interval);
    let mesh_http = coordinator.http_client().clone();

    info!("fabricd running");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = coordinator.persistence_tick() {
                    error!(error = %err, "checkpoint write failed");
                }
                if let Some(mesh) = coordinator.mesh() {
                    let mut mesh = mesh.lock().await;
                    mesh.heartbeat_tick(&mesh_http).await;
                    let batch = mesh.collect_relay_batch(&coordinator.registry());
                    fabric_service::mesh::MeshRelay::send_relay_batch(&mesh_http, batch).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, writing final checkpoint");
                if let Err(err) = coordinator.checkpoint_now() {
                    error!(error = %err, "final checkpoint write failed");
                }
                break;
            }
        }
    }

    Ok(())
}
