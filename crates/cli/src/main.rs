use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maestro_core::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "maestroctl", version, about = "Maestro synthesis & reconciliation engine")]
struct Cli {
    /// Container image that wraps and executes synthesizers
    #[arg(long = "wrapper-image")]
    wrapper_image: String,

    /// Per-synthesis attempt cap before marking the slot failed
    #[arg(long = "max-restarts", default_value_t = 3)]
    max_restarts: i32,

    /// Per-synthesis and per-reconcile wall clock bound
    #[arg(long = "timeout", value_parser = parse_duration, default_value = "5m")]
    timeout: Duration,

    /// Global cap on concurrently active syntheses
    #[arg(long = "concurrency-limit", default_value_t = 10)]
    concurrency_limit: usize,

    /// Inter-dispatch and inter-rollout spacing
    #[arg(long = "cooldown", value_parser = parse_duration, default_value = "30s")]
    cooldown: Duration,

    /// Poll interval for resources that are not yet ready
    #[arg(long = "readiness-poll-interval", value_parser = parse_duration, default_value = "5s")]
    readiness_poll_interval: Duration,

    /// Rate limit for downstream OpenAPI schema fetches
    #[arg(long = "discovery-rps", default_value_t = 2.0)]
    discovery_rps: f64,

    /// Kubeconfig for the downstream cluster (defaults to the engine's own)
    #[arg(long = "downstream-kubeconfig")]
    downstream_kubeconfig: Option<PathBuf>,
}

fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

fn init_tracing() {
    let env = std::env::var("MAESTRO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MAESTRO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MAESTRO_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = EngineConfig {
        wrapper_image: cli.wrapper_image,
        max_restarts: cli.max_restarts,
        timeout: cli.timeout,
        concurrency_limit: cli.concurrency_limit,
        cooldown: cli.cooldown,
        readiness_poll_interval: cli.readiness_poll_interval,
        discovery_rps: cli.discovery_rps,
        downstream_kubeconfig: cli.downstream_kubeconfig,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    maestro_engine::run(config, cancel).await
}
