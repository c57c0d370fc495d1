// Monitor entry point
// Loads the runtime configuration, builds the engine, starts every
// probe loop, and serves the metrics exposition endpoint
//
// Numan Thabit 2025 Nov

use anyhow::{Context, Result};
use clap::Parser;
use pulsar_sentinel::alerts::analytics::EventKind;
use pulsar_sentinel::config::Config;
use pulsar_sentinel::engine::Engine;
use pulsar_sentinel::{metrics, scheduler};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "../config/runtime.yml";

const CONFIG_ENV_VAR: &str = "PULSAR_OPS_MONITOR_CFG";

const DEFAULT_METRICS_PORT: &str = ":8089";

#[derive(Parser, Debug)]
#[command(name = "pulsar-sentinel", about = "Pulsar cluster availability monitor")]
struct Args {
    /// config file for monitoring
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let effective_cfg_file = args
        .config
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    info!(config = %effective_cfg_file.display(), "config file");

    let cfg = Config::load(&effective_cfg_file)?;

    // container CPU quotas are not reflected in the detected parallelism,
    // honor an explicit worker count when one is set
    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = std::env::var("GOMAXPROCS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
    {
        runtime.worker_threads(workers);
    }
    runtime
        .enable_all()
        .build()
        .context("build async runtime")?
        .block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let engine = Engine::new(cfg)?;

    if let Some(analytics) = engine.incidents.analytics() {
        analytics.event(EventKind::AppStart, &engine.cfg.name);
    }

    scheduler::start(engine.clone()).await;

    if engine.cfg.prometheus_config.expose_metrics {
        let port = if engine.cfg.prometheus_config.port.is_empty() {
            DEFAULT_METRICS_PORT
        } else {
            &engine.cfg.prometheus_config.port
        };
        let addr = format!("0.0.0.0{port}");
        info!(addr = %addr, "serving metrics");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind metrics listener on {addr}"))?;
        axum::serve(listener, metrics::metrics_router())
            .await
            .context("serve metrics endpoint")?;
    } else {
        std::future::pending::<()>().await;
    }

    // the serve loop only returns on forced termination
    std::process::exit(2);
}
