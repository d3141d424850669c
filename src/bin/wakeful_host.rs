//! Headless host for the wakeful scheduler.
//!
//! Loads configuration from the path given as the first argument, or from
//! the default config path, starts the scheduler and keeps a heartbeat task
//! running until interrupted with Ctrl-C.
//!
//! All tracing output goes to stderr.

use std::path::PathBuf;
use std::time::Duration;

use wakeful::WakefulConfig;
use wakeful::runtime::WakefulRuntime;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

fn load_config() -> anyhow::Result<WakefulConfig> {
    let (path, explicit) = match std::env::args_os().nth(1) {
        Some(arg) => (PathBuf::from(arg), true),
        None => (WakefulConfig::default_config_path(), false),
    };
    if !explicit && !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(WakefulConfig::default());
    }
    let config = WakefulConfig::from_file(&path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("wakeful-host starting");

    let config = load_config()?;
    let runtime = WakefulRuntime::start(&config, tokio::runtime::Handle::current())
        .map_err(|e| {
            tracing::error!(error = %e, "wakeful-host failed to start");
            anyhow::anyhow!("wakeful-host failed: {e}")
        })?;

    let heartbeat = runtime.scheduler().schedule_with_fixed_delay(
        || tracing::info!("heartbeat"),
        runtime.executor(),
        Duration::ZERO,
        HEARTBEAT_INTERVAL,
    )?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");

    heartbeat.cancel();
    runtime.shutdown().await;
    tracing::info!("wakeful-host shut down cleanly");
    Ok(())
}
