use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use g502d::config::{self, DEFAULT_CONFIG_PATH};
use g502d::{dbus, udev_monitor};

#[derive(Parser)]
#[command(name = "g502d", about = "G502 HERO configuration daemon", version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("g502d=info")),
        )
        .init();

    let args = Args::parse();
    let config = config::load_config(&args.config);

    info!(
        "g502d {} starting (queue depth {}, switch button {})",
        env!("CARGO_PKG_VERSION"),
        config.queue_depth,
        config.switch_button
    );

    let (tx, rx) = mpsc::channel(32);
    let _monitor = udev_monitor::spawn_monitor(tx).context("Failed to start udev monitor")?;

    dbus::run_server(rx, config).await
}
