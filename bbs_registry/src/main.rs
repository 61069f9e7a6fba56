//! Registry executable: boots a `bbs::RegistryService` and serves rank
//! assignment, liveness tracking, and eviction until a termination signal
//! arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use bbs::store::DataStore;
use bbs::utils;
use bbs::{pf_error, pf_info, RegistryService};

/// Distributed BBS registry service: assigns server ranks and tracks
/// liveness by heartbeat.
#[derive(Parser, Debug)]
#[command(name = "bbs_registry")]
struct Cli {
    /// Data directory for the persisted server roster.
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// REP bind endpoint.
    #[arg(long, default_value = "tcp://*:5559")]
    bind_addr: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::logger_init();
    utils::set_me("registry");

    let cli = Cli::parse();

    let store = match DataStore::new(&cli.data_dir) {
        Ok(s) => s,
        Err(e) => {
            pf_error!("failed to open data directory {}: {}", cli.data_dir, e);
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(RegistryService::new(store));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        pf_error!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    let eviction_registry = Arc::clone(&registry);
    tokio::spawn(eviction_registry.run_eviction_sweep());

    tokio::select! {
        result = registry.serve(&cli.bind_addr) => {
            if let Err(e) = result {
                pf_error!("registry server exited with error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = shutdown_rx.recv() => {
            pf_info!("received shutdown signal, exiting");
        }
    }

    ExitCode::SUCCESS
}
