//! Message server executable: boots a `bbs::MessageServer` and runs its
//! request loop and background tasks until a termination signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use bbs::parsed_config;
use bbs::server::{MessageServer, ServerAddrs};
use bbs::store::DataStore;
use bbs::utils::{self, CoordConfig};
use bbs::{pf_error, pf_info};

/// Distributed BBS message server.
#[derive(Parser, Debug)]
#[command(name = "bbs_server")]
struct Cli {
    /// This server's name. Falls back to the `SERVER_NAME` environment
    /// variable if not given, matching the original deployment's
    /// environment-driven naming (spec S6).
    #[arg(short, long)]
    name: Option<String>,

    /// Data directory for this server's persisted state.
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Registry REP endpoint.
    #[arg(long, default_value = "tcp://127.0.0.1:5559")]
    registry_addr: String,

    /// Broker backend endpoint (this server's client-facing REP bind).
    #[arg(long, default_value = "tcp://*:5556")]
    broker_backend_addr: String,

    /// Proxy backend endpoint (this server connects here to publish).
    #[arg(long, default_value = "tcp://127.0.0.1:5557")]
    proxy_backend_addr: String,

    /// Proxy frontend endpoint (this server subscribes to `servers` here).
    #[arg(long, default_value = "tcp://127.0.0.1:5558")]
    proxy_frontend_addr: String,

    /// Replication RPC bind endpoint.
    #[arg(long, default_value = "tcp://*:6000")]
    replication_bind_addr: String,

    /// Election RPC bind endpoint.
    #[arg(long, default_value = "tcp://*:6001")]
    election_bind_addr: String,

    /// Free-form TOML overrides for tunables (heartbeat/election/sync
    /// intervals); see [`CoordConfig`].
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::logger_init();

    let cli = Cli::parse();
    let name = cli
        .name
        .or_else(|| std::env::var("SERVER_NAME").ok())
        .unwrap_or_else(|| "server".to_string());
    utils::set_me(name.clone());

    let config: CoordConfig = match parsed_config!(cli.config.as_deref() => CoordConfig;
        heartbeat_interval_s, heartbeat_timeout_s, eviction_sweep_s, peer_refresh_s,
        monitor_tick_s, election_timeout_s, election_rpc_timeout_ms,
        replication_rpc_timeout_ms, berkeley_rpc_timeout_ms, sync_interval)
    {
        Ok(c) => c,
        Err(e) => {
            pf_error!("invalid --config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = match DataStore::new(&cli.data_dir) {
        Ok(s) => s,
        Err(e) => {
            pf_error!("failed to open data directory {}: {}", cli.data_dir, e);
            return ExitCode::FAILURE;
        }
    };

    let addrs = ServerAddrs {
        registry_addr: cli.registry_addr,
        broker_backend_addr: cli.broker_backend_addr,
        proxy_backend_addr: cli.proxy_backend_addr,
        proxy_frontend_addr: cli.proxy_frontend_addr,
        replication_bind_addr: cli.replication_bind_addr,
        election_bind_addr: cli.election_bind_addr,
    };

    let server = match MessageServer::bootstrap(name, addrs, config, store).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            pf_error!("failed to bootstrap server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        pf_error!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    let run_server = Arc::clone(&server);
    tokio::select! {
        result = run_server.run() => {
            if let Err(e) = result {
                pf_error!("server loop exited with error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = shutdown_rx.recv() => {
            pf_info!("received shutdown signal, persisting final state");
        }
    }

    ExitCode::SUCCESS
}
