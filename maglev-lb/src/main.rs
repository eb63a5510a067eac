//! maglev-lb: Maglev-style consistent-hashing L4 load balancer.
//!
//! Steers IPv4 flows to a backend pool with the Maglev scheme (Eisenbud et
//! al., NSDI '16): a prime-length permutation table gives near-uniform load
//! and minimal remapping on membership change, and a per-worker flow cache
//! keeps established connections on their backend. Frames are captured and
//! re-emitted on one interface via AF_PACKET; destination checksum fixup is
//! left to NIC offload or a downstream hop.
//!
//! Send SIGHUP to reload the backend list from the config file; the new
//! table is published atomically and the reload returns only after every
//! worker has picked it up.

mod config;
mod telemetry;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use maglev_lb_core::{BackendSet, RouterControl};
use tokio::signal;
use tracing::{error, info, warn};

use config::Config;
use telemetry::Telemetry;
use worker::Dataplane;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "maglev-lb",
    about = "Maglev-style consistent-hashing L4 load balancer",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting maglev-lb"
    );

    let config = Config::load(&cli.config).context("loading configuration")?;
    info!(
        interface = %config.interface,
        backends = config.backends.len(),
        table_size = config.router.table_size,
        "configuration loaded"
    );

    // --- Build the initial routing epoch ---
    let backends = BackendSet::from_iter(config.backends.iter().copied());
    info!(pool = %format_pool(&backends), "backend pool");

    let control = Arc::new(
        RouterControl::new(backends, config.router.table_config())
            .context("building lookup table")?,
    );

    // --- Start steering workers ---
    let dataplane = Dataplane::start(&config, control.clone()).context("starting dataplane")?;

    // --- Start the telemetry endpoint ---
    let telemetry_handle = config.telemetry.scrape_bind.map(|bind| {
        let endpoint = Telemetry {
            interface: config.interface.clone(),
            stats: dataplane.stats.clone(),
            control: control.clone(),
        };
        let path = config.telemetry.scrape_path.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoint.serve(bind, path).await {
                error!(error = %e, "telemetry endpoint error");
            }
        })
    });

    // --- Reload backend membership on SIGHUP ---
    let reload_handle = spawn_reload_task(cli.config.clone(), control.clone())?;

    info!("maglev-lb is running. Press Ctrl+C to stop.");

    let cause = wait_for_shutdown().await;
    info!(signal = cause, "shutdown signal received, cleaning up...");

    reload_handle.abort();
    if let Some(handle) = telemetry_handle {
        handle.abort();
    }
    dataplane.shutdown();

    info!("maglev-lb stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Membership Reload
// ---------------------------------------------------------------------------

/// Re-read the config on SIGHUP and install the new backend set.
///
/// Only the backend list is applied at runtime; table and cache geometry
/// changes still need a restart. A failed reload keeps the current epoch.
fn spawn_reload_task(
    config_path: PathBuf,
    control: Arc<RouterControl>,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(config = %config_path.display(), "SIGHUP received, reloading backend set");

            let new_config = match Config::load(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "config reload failed, keeping current backends");
                    continue;
                }
            };

            let backends = BackendSet::from_iter(new_config.backends.iter().copied());
            let pool = format_pool(&backends);
            let control = control.clone();

            // install() blocks until every worker acknowledges the epoch.
            match tokio::task::spawn_blocking(move || control.install(backends)).await {
                Ok(Ok(())) => info!(pool = %pool, "backend set reloaded"),
                Ok(Err(e)) => error!(error = %e, "table rebuild failed, keeping current backends"),
                Err(e) => warn!(error = %e, "reload task interrupted"),
            }
        }
    }))
}

fn format_pool(backends: &BackendSet) -> String {
    backends
        .iter()
        .map(|addr| addr.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

/// Blocks until a shutdown signal arrives and names the one that did.
async fn wait_for_shutdown() -> &'static str {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}
