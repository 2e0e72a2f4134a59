use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use glove_link_lib::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, LinkConfig};
use glove_link_lib::core::bluetooth::{BluestTransport, LinkManager, mailbox, reading_sink};
use glove_link_lib::logging;
use log::{LevelFilter, error, info, warn};
use tokio::sync::mpsc;

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init(LevelFilter::Info) {
        eprintln!("Logger already initialised: {}", e);
    }

    let path = config_path();
    let config = LinkConfig::load_config(&path)
        .await
        .with_context(|| format!("Failed to load link config from {:?}", path))?;
    let catalog = config.catalog()?;

    let (sender, link_mailbox) = mailbox();
    let transport = Arc::new(BluestTransport::new(sender.clone()).await?);
    let mut manager = LinkManager::new(
        config.settings(),
        catalog.clone(),
        transport,
        sender,
        link_mailbox,
    );

    let (readings_tx, mut readings_rx) = mpsc::unbounded_channel();
    for entry in catalog.entries() {
        manager.register_channel_sink(entry.channel, reading_sink(entry.channel, readings_tx.clone()))?;
    }
    drop(readings_tx);

    let printer = tokio::spawn(async move {
        while let Some(reading) = readings_rx.recv().await {
            info!("{}: {}", reading.channel.label(), reading.value);
        }
    });

    let link = manager.start();
    link.start_scan_and_connect()?;

    let watcher = link.clone();
    tokio::spawn(async move {
        match watcher.wait_for_status(|status| status.setup_finished).await {
            Ok(_) => info!("Glove link is ready, polling sensors"),
            Err(e) => warn!("Link stopped before it became ready: {}", e),
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    link.shutdown()?;
    link.stopped().await;
    printer.abort();
    Ok(())
}
