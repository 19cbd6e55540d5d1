//! Portald - captive portal detection daemon
//!
//! Watches the default network and reports whether it sits behind a captive portal.

use anyhow::{Context, Result};
use clap::Parser;
use portald::config::Config;
use portald::detector::SystemClock;
use portald::metrics::TracingMetrics;
use portald::network::{self, NetworkSource, NmcliSource};
use portald::probe::HttpProbe;
use portald::{service, CaptivePortalState, LogObserver, NetworkIdentity, PortalDetector, StrategyId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portald")]
#[command(about = "Captive Portal Detection Daemon", long_about = None)]
struct Args {
    /// Run in daemon mode (continuous monitoring)
    #[arg(short, long)]
    daemon: bool,

    /// Config file path (default: search standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Detection strategy override: backoff | fixed_interval
    #[arg(short, long)]
    strategy: Option<String>,
}

#[derive(Serialize)]
struct Report<'a> {
    network: &'a NetworkIdentity,
    #[serde(flatten)]
    state: &'a CaptivePortalState,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut cfg = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(strategy) = args.strategy {
        cfg.detector.strategy = strategy;
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)),
        )
        .init();

    tracing::info!("Portald v{} - Captive Portal Detection", env!("CARGO_PKG_VERSION"));

    let detector_config = cfg
        .detector_config()
        .context("Invalid detector configuration")?;
    let detector = PortalDetector::new(detector_config, Arc::new(SystemClock), Arc::new(TracingMetrics))?;
    let probe = HttpProbe::new().context("Failed to build HTTP client")?;

    if args.daemon {
        run_daemon(&cfg, detector, probe).await
    } else {
        run_once(detector, probe).await
    }
}

/// Run once - probe the current default network and print the result as JSON
async fn run_once(detector: PortalDetector, probe: HttpProbe) -> Result<()> {
    let Some(network) = NmcliSource
        .default_network()
        .await
        .context("Failed to query default network")?
    else {
        tracing::warn!("No default network");
        return Ok(());
    };

    if !network.is_connected() {
        tracing::warn!("'{}' is not connected ({})", network.name, network.connection_state);
        return Ok(());
    }

    let (handle, task) = service::spawn(detector, Arc::new(probe));

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .add_observer(Arc::new(
            move |network: Option<&NetworkIdentity>, state: &CaptivePortalState| {
                if let Some(network) = network {
                    let _ = tx.send((network.clone(), *state));
                }
            },
        ))
        .await?;
    handle.network_changed(Some(network))?;
    handle.enable(true)?;

    let (network, state) = rx.recv().await.context("Detector stopped before reporting")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&Report {
            network: &network,
            state: &state,
        })?
    );

    handle.shutdown();
    task.await.ok();
    Ok(())
}

/// Run in daemon mode - continuous monitoring
async fn run_daemon(cfg: &Config, detector: PortalDetector, probe: HttpProbe) -> Result<()> {
    let strategy: StrategyId = detector.strategy_id();
    let poll_interval = cfg
        .network_poll_interval()
        .context("Invalid network configuration")?;
    let (handle, task) = service::spawn(detector, Arc::new(probe));

    tracing::info!("Starting daemon mode...");
    tracing::info!("Probe URL: {}", cfg.detector.probe_url);
    tracing::info!("Strategy: {}", strategy);
    tracing::info!("Network poll interval: {:?}", poll_interval);
    tracing::info!("---");

    handle.add_and_notify_current(Arc::new(LogObserver)).await?;
    if cfg.detector.enable_on_start {
        handle.enable(true)?;
    }

    let watcher = tokio::spawn(network::watch(
        NmcliSource,
        handle.clone(),
        poll_interval,
    ));

    tokio::select! {
        result = watcher => {
            result.context("Network watcher panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    handle.shutdown();
    task.await.ok();
    Ok(())
}
