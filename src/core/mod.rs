//! Core functionality for iPowerUp Link
//! This module contains the BLE session and the power bank protocol codec.

pub mod bluetooth;
pub mod power_bank;

// Re-export commonly used types
pub use bluetooth::{DeviceSession, SessionEvent};
pub use power_bank::{decode_response, decode_status, PowerBankStatus, TemperatureUnit};
