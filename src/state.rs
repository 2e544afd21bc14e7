//! Application state management
//! This module defines and manages the global application state.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::AppConfig;
use crate::core::bluetooth::{BleTransport, BluestTransport, DeviceSession, PhoneBatterySource};

/// Global application state
pub struct AppState<T: BleTransport = BluestTransport> {
    /// The device session instance
    pub session: DeviceSession<T>,
    pub config: AppConfig,
}

impl AppState<BluestTransport> {
    /// Creates a new AppState on the platform's default adapter
    pub async fn new(config: AppConfig, battery: Arc<dyn PhoneBatterySource>) -> Result<Self> {
        info!("Initializing Bluetooth transport...");
        let transport = BluestTransport::new().await?;
        Self::with_transport(Arc::new(transport), config, battery).await
    }
}

impl<T: BleTransport> AppState<T> {
    pub async fn with_transport(
        transport: Arc<T>,
        config: AppConfig,
        battery: Arc<dyn PhoneBatterySource>,
    ) -> Result<Self> {
        let session = DeviceSession::new(transport, config.session.clone(), battery);
        if let Err(e) = session.watch_radio().await {
            warn!("Radio state will not be tracked: {}", e);
        }
        Ok(Self { session, config })
    }

    /// Gets a handle to the device session
    pub fn session(&self) -> DeviceSession<T> {
        self.session.clone()
    }
}
