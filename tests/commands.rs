mod support;

use std::sync::Arc;

use ipowerup_link_lib::commands;
use ipowerup_link_lib::config::AppConfig;
use ipowerup_link_lib::core::bluetooth::{FixedBatteryLevel, SessionState};
use ipowerup_link_lib::core::power_bank::TemperatureUnit;
use ipowerup_link_lib::state::AppState;
use support::FakeTransport;

#[tokio::test(start_paused = true)]
async fn commands_report_errors_as_strings() {
    let transport = FakeTransport::new();
    let app_state = AppState::with_transport(transport.clone(), AppConfig::default(), Arc::new(FixedBatteryLevel(60.0)))
        .await
        .unwrap();

    let err = commands::enable_phone_charging(&app_state).await.unwrap_err();
    assert!(err.starts_with("not connected"), "{}", err);

    let err = commands::connect_to_device("missing".to_string(), &app_state).await.unwrap_err();
    assert_eq!(err, "device not found with ID: missing");
}

#[tokio::test(start_paused = true)]
async fn scanning_round_trip_through_commands() {
    let transport = FakeTransport::new();
    let app_state = AppState::with_transport(transport.clone(), AppConfig::default(), Arc::new(FixedBatteryLevel(60.0)))
        .await
        .unwrap();

    commands::start_scanning(&app_state).await.unwrap();
    assert_eq!(commands::get_session_state(&app_state).await.unwrap(), SessionState::Scanning);
    assert!(commands::get_discovered_devices(&app_state).await.unwrap().is_empty());

    commands::stop_scanning(&app_state).await.unwrap();
    commands::disconnect_device(&app_state).await.unwrap();
    commands::set_temperature_unit(TemperatureUnit::Fahrenheit, &app_state).await.unwrap();
    assert_eq!(commands::get_session_state(&app_state).await.unwrap(), SessionState::Idle);
    assert_eq!(transport.scans(), 1);
}
