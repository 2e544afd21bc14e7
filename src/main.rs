use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ipowerup_link_lib::commands;
use ipowerup_link_lib::config::AppConfig;
use ipowerup_link_lib::core::bluetooth::FixedBatteryLevel;
use ipowerup_link_lib::logging;
use ipowerup_link_lib::state::AppState;
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

const CONFIG_DIR_ENV: &str = "IPOWERUP_CONFIG_DIR";

fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = AppConfig::load_config(&config_dir).await.unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    if let Err(e) = logging::init(config.log_level_filter(), None) {
        eprintln!("Failed to install logger: {}", e);
    }
    info!("Starting iPowerUp Link");

    // Desktop hosts have no phone battery to report.
    let battery = Arc::new(FixedBatteryLevel(config.session.fallback_phone_battery_percent));
    let app_state = AppState::new(config, battery).await?;

    let mut events = app_state.session.subscribe();
    if let Err(e) = commands::start_scanning(&app_state).await {
        error!("Could not start scanning: {}", e);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} session events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    if let Err(e) = commands::disconnect_device(&app_state).await {
        warn!("Disconnect on shutdown failed: {}", e);
    }
    Ok(())
}
