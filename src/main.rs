//! OpenVD - virtual display daemon
//!
//! Plugs virtual monitors into the EVDI kernel driver, one per configured
//! display, and keeps them serviced until SIGTERM or SIGINT.

mod config;
mod display;
mod fps;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const DEFAULT_FILTER: &str = "openvd=info,openvd_evdi=info,openvd_edid=info";

#[derive(Parser, Debug)]
#[command(name = "openvd", version, about = "Virtual display daemon for EVDI")]
struct Cli {
    /// Config file (default: ~/.config/openvd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture frames from every display, overriding the config
    #[arg(long)]
    capture: bool,

    /// Log filter, e.g. "debug" or "openvd_evdi=trace"
    #[arg(long, env = "OPENVD_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_FILTER.into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting OpenVD {}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.capture {
        config.capture.enabled = true;
    }

    let plans = config
        .displays
        .iter()
        .enumerate()
        .map(|(index, display)| display::prepare(index, display))
        .collect::<Result<Vec<_>>>()?;

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
            }
        });
    }

    // Display loops block on poll(2), so each gets its own blocking thread
    let stop = Arc::new(AtomicBool::new(false));
    let mut displays = JoinSet::new();
    for plan in plans {
        let stop = Arc::clone(&stop);
        let capture = config.capture.clone();
        displays.spawn_blocking(move || {
            let label = plan.label.clone();
            (label, display::serve(plan, &capture, &stop))
        });
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            joined = displays.join_next() => {
                let Some(joined) = joined else {
                    break;
                };
                if !record(joined) {
                    failed += 1;
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, removing displays...");
                break;
            }
        }
    }

    // Stop the remaining loops; each disconnects its monitor on the way out
    stop.store(true, Ordering::Relaxed);
    while let Some(joined) = displays.join_next().await {
        if !record(joined) {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} display(s) failed", failed);
    }
    info!("All displays removed");
    Ok(())
}

/// Log how one display loop ended. Returns false if it failed.
fn record(joined: Result<(String, Result<()>), tokio::task::JoinError>) -> bool {
    match joined {
        Ok((label, Ok(()))) => {
            info!("Display {} finished", label);
            true
        }
        Ok((label, Err(e))) => {
            error!("Display {}: {:#}", label, e);
            false
        }
        Err(e) => {
            warn!("Display task panicked: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_reads_log_level_flag() {
        let cli = Cli::try_parse_from(["openvd", "--capture", "--log-level", "debug"]).unwrap();
        assert!(cli.capture);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_config_path() {
        let cli = Cli::try_parse_from(["openvd", "-c", "/tmp/openvd.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/openvd.toml")));
        assert!(!cli.capture);
    }
}
