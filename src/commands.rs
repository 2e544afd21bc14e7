//! UI commands
//! This module defines all the commands that can be invoked from the frontend.
//! Each one reports failure as a display string.

use crate::core::bluetooth::{BleTransport, ChargeSource, DiscoveredDevice, SessionState};
use crate::core::power_bank::TemperatureUnit;
use crate::state::AppState;

/// Starts scanning for iPowerUp cases
///
/// # Returns
/// Nothing, but the session emits during scanning:
/// - "scan-started" when scanning is started
/// - "device-found" / "device-updated" as cases are seen
/// - "scan-stopped" when scanning ends
pub async fn start_scanning<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.start_scanning().await.map_err(|e| e.to_string())
}

pub async fn stop_scanning<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.stop_scanning().await.map_err(|e| e.to_string())
}

/// Connects to a discovered case
///
/// # Arguments
/// * `device_id` - The platform identifier from a "device-found" event
/// * `app_state` - The application state
pub async fn connect_to_device<T: BleTransport>(device_id: String, app_state: &AppState<T>) -> Result<(), String> {
    app_state
        .session
        .connect_to_device(&device_id)
        .await
        .map_err(|e| e.to_string())
}

/// Disconnects from the current case, whatever the session is doing
pub async fn disconnect_device<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.disconnect_device().await.map_err(|e| e.to_string())
}

pub async fn enable_phone_charging<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.enable_phone_charging().await.map_err(|e| e.to_string())
}

pub async fn stop_charging<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.stop_charging().await.map_err(|e| e.to_string())
}

pub async fn query_power_bank_status<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state
        .session
        .query_power_bank_status()
        .await
        .map_err(|e| e.to_string())
}

pub async fn query_charger_config_status<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state
        .session
        .query_charger_config_status()
        .await
        .map_err(|e| e.to_string())
}

pub async fn query_charging_history<T: BleTransport>(
    source: ChargeSource,
    app_state: &AppState<T>,
) -> Result<(), String> {
    app_state
        .session
        .query_charging_history(source)
        .await
        .map_err(|e| e.to_string())
}

pub async fn query_today_status<T: BleTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.query_today_status().await.map_err(|e| e.to_string())
}

pub async fn set_temperature_unit<T: BleTransport>(unit: TemperatureUnit, app_state: &AppState<T>) -> Result<(), String> {
    app_state.session.set_temperature_unit(unit).await;
    Ok(())
}

pub async fn get_discovered_devices<T: BleTransport>(app_state: &AppState<T>) -> Result<Vec<DiscoveredDevice>, String> {
    Ok(app_state.session.discovered_devices().await)
}

pub async fn get_session_state<T: BleTransport>(app_state: &AppState<T>) -> Result<SessionState, String> {
    Ok(app_state.session.state().await)
}
