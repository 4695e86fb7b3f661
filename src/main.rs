// Main entrypoint for the Roxxy reverse proxy.

mod accesslog;
mod app;
mod config;
mod controller;
#[path = "shared/dedlog/mod.rs"]
mod dedlog;
mod http;
#[path = "k8s/probe/liveness/mod.rs"]
mod liveness;
mod metrics;
mod middleware;
mod router;
mod shutdown;
mod store;
mod tls;
#[path = "shared/time/mod.rs"]
mod time;
mod traces;

use crate::config::{Config, ConfigTrait};
use crate::shutdown::GracefulShutdown;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "cfg/roxxy.cfg.yaml";
const CONFIG_PATH_LOCAL: &str = "cfg/roxxy.cfg.local.yaml";

/// Roxxy - a dynamic, Redis-coordinated multi-tenant reverse proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path
    #[arg(short, long, value_name = "FILE")]
    cfg: Option<PathBuf>,
}

/// Logs the configured thread parallelism. Tokio's runtime already uses all
/// available cores; this only affects what we report at startup.
fn set_max_num_cpus(cfg: &Config) {
    let cores = cfg.runtime().num_cpus;
    if cores == 0 {
        let cores = num_cpus::get();
        info!(
            component = "main",
            event = "num_cpus_configured",
            num_cpus = cores,
            "available cores value configured (using all available cores)"
        );
    } else {
        warn!(
            component = "main",
            event = "num_cpus_configured",
            num_cpus = cores,
            "available cores value configured"
        );
    }
}

/// Loads the configuration struct from YAML file.
/// Tries a local override first, then falls back to the default config.
fn load_cfg(path: Option<PathBuf>) -> Result<Config> {
    if let Some(custom_path) = path {
        let cfg = Config::load(&custom_path)
            .with_context(|| format!("failed to load custom config from {:?}", custom_path))?;
        info!(component = "config", event = "load_success", path = ?custom_path, "config loaded");
        return Ok(cfg);
    }

    match Config::load(PathBuf::from(CONFIG_PATH_LOCAL)) {
        Ok(cfg) => {
            info!(component = "config", event = "load_success", path = CONFIG_PATH_LOCAL, "config loaded");
            Ok(cfg)
        }
        Err(_) => {
            let cfg = Config::load(PathBuf::from(CONFIG_PATH))
                .with_context(|| format!("failed to load config from {}", CONFIG_PATH))?;
            info!(component = "config", event = "load_success", path = CONFIG_PATH, "config loaded");
            Ok(cfg)
        }
    }
}

/// Configures structured logging based on configuration.
fn configure_logger(cfg: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_level = cfg
        .logs()
        .and_then(|logs| logs.level.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("info");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cfg.is_prod() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    // Start time caching to reduce syscalls.
    let _ctime_token = time::start(Duration::from_millis(1));

    let cfg = load_cfg(args.cfg)?;

    configure_logger(&cfg);
    set_max_num_cpus(&cfg);

    let dedup_logger_token = shutdown_token.clone();
    tokio::task::spawn(async move {
        dedlog::start_dedup_logger(dedup_logger_token).await;
    });

    let graceful_shutdown = GracefulShutdown::new(shutdown_token.clone());
    graceful_shutdown
        .set_graceful_timeout(Duration::from_secs(60))
        .await;

    let probe_timeout = cfg
        .k8s()
        .and_then(|k8s| k8s.probe.timeout)
        .unwrap_or(Duration::from_secs(5));
    let probe = Arc::new(liveness::Probe::new(probe_timeout)) as Arc<dyn liveness::Prober>;

    let app = app::App::new(shutdown_token.clone(), cfg, probe).await?;

    graceful_shutdown.add(1);

    let app_clone = app.clone();
    let graceful_done = Arc::new(graceful_shutdown.clone());
    tokio::task::spawn(async move {
        if let Err(e) = app_clone.serve(graceful_done.clone()).await {
            error!(
                component = "main",
                scope = "app",
                event = "start_failed",
                error = %e,
                "failed to start app"
            );
        }
        graceful_done.done();
    });

    if let Err(e) = graceful_shutdown.await_shutdown().await {
        error!(
            component = "main",
            scope = "service",
            event = "graceful_shutdown_failed",
            error = %e,
            "failed to gracefully shut down service"
        );
        return Err(e);
    }

    Ok(())
}
