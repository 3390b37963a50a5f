//! cdnprobe - single-shot latency and loss collector.
//!
//! Resolves each configured target to its IPv4 addresses, pings every
//! address, and prints one timestamped record per target.

mod collector;
mod config;
mod models;
mod output;
mod probe;
mod stats;

use collector::Collector;
use config::AppConfig;
use probe::{build_transport, SystemResolver};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging; stdout is reserved for results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cdnprobe=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        probe_id = %cfg.probe_id,
        targets = cfg.targets.len(),
        count = cfg.probe.count,
        privileged = cfg.probe.privileged,
        "Loaded configuration"
    );

    let transport = build_transport(cfg.transport, cfg.probe.privileged);
    let mut collector = Collector::new(Arc::new(SystemResolver), transport, cfg.probe.clone());
    if let Some(limit) = cfg.target_timeout {
        collector = collector.with_target_timeout(limit);
    }

    let results = collector.collect(&cfg.targets, &cfg.probe_id).await;
    if results.len() < cfg.targets.len() {
        tracing::warn!(
            "Collected {} of {} targets",
            results.len(),
            cfg.targets.len()
        );
    }

    output::print_results(&results, cfg.output)?;

    Ok(())
}
