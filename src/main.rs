//! DNSTT Fleet supervisor entry point
//!
//! Loads the configuration, wires up logging and the registry client, brings
//! the fleet up, and runs the monitor loop until SIGINT/SIGTERM drains it.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use dnstt_fleet::config::Config;
use dnstt_fleet::logging;
use dnstt_fleet::registry::XuiClient;
use dnstt_fleet::supervisor::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Error: failed to set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("DNSTT fleet supervisor starting");

    let registry = match XuiClient::new(&config.xui, config.health_check.retry_count) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build registry client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Arc::new(Supervisor::new(config, registry));

    // A signal at any point, including mid start-up, requests the drain.
    let drain = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
            supervisor.shutdown().await;
        })
    };

    supervisor.start().await;
    log_fleet_summary(&supervisor);

    // Monitor until shutdown wakes it; the drain task finishes the stop.
    supervisor.run_monitor().await;
    let _ = drain.await;

    let reload_failures = supervisor.reload_failures();
    if reload_failures > 0 {
        warn!(
            "{} registry reloads failed after successful adds this run",
            reload_failures
        );
    }

    info!("DNSTT fleet supervisor stopped");
    ExitCode::SUCCESS
}

fn log_fleet_summary(supervisor: &Supervisor) {
    let status = supervisor.fleet_status();
    let parents_up = status
        .iter()
        .filter(|s| s.ssh_id.is_none() && s.state == dnstt_fleet::supervisor::TunnelState::Running)
        .count();
    let children_up = status
        .iter()
        .filter(|s| s.ssh_id.is_some() && s.state == dnstt_fleet::supervisor::TunnelState::Running)
        .count();
    let published = status.iter().filter(|s| s.published).count();
    info!(
        "Fleet up: {} DNSTT tunnels, {} SSH sessions ({} published)",
        parents_up, children_up, published
    );
}
