//! Shared plumbing for the `hindsight` CLI and the host-invoked hook
//! executables.  The binaries stay thin: construct the engine, invoke one
//! library function, report the exit code.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use hindsight_config::AppConfig;
use hindsight_engine::Engine;
use hindsight_tools::ToolSurface;

pub mod hook;

/// Config file path: `$HINDSIGHT_CONFIG` or `./hindsight.toml`.
pub fn config_path() -> PathBuf {
    std::env::var("HINDSIGHT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("hindsight.toml"))
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    AppConfig::load_from(&path)
        .with_context(|| format!("loading config from {}", path.display()))
}

/// Interactive-command logging: stderr only, `RUST_LOG`-filtered.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Hook logging: stderr plus a daily-rolling file, so host-invoked runs leave
/// a trail without a TTY.  The returned guard must be held for the process
/// lifetime.
pub fn init_hook_logging(config: &AppConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = PathBuf::from(&config.store.path).join("logs");
    let appender = tracing_appender::rolling::daily(log_dir, "hook.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

pub async fn build_engine() -> Result<Engine> {
    let config = load_config()?;
    Engine::open(config).await.context("opening engine")
}

pub async fn build_surface() -> Result<ToolSurface> {
    let engine = build_engine().await?;
    // Earlier sessions' validations keep shaping ranking across restarts.
    if let Err(err) = engine.learner.rebuild_from_store().await {
        tracing::warn!(error = %err, "learner rebuild failed — starting with empty aggregates");
    }
    Ok(ToolSurface::new(engine))
}
