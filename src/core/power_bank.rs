//! iPowerUp response parsing
//! This module turns notification payloads received from the case into typed responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::bluetooth::commands::Opcode;
use crate::core::bluetooth::constants::{CHARGER_CONFIG_RESPONSE_MIN_LEN, STATUS_RESPONSE_MIN_LEN};

/// Unit the case temperature is reported in. The device always sends Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Converts a Celsius reading into this unit
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            Self::Celsius => celsius,
            Self::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }
}

/// Telemetry snapshot decoded from a 0x04 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerBankStatus {
    pub case_battery_voltage_millivolts: u16,
    /// Raw byte, the device keeps it within 0-100
    pub case_battery_percent: u8,
    pub solar_charging: bool,
    pub usb_charging: bool,
    pub phone_charging: bool,
    pub case_voltage_below_min: bool,
    pub case_voltage_above_max: bool,
    pub case_temp_below_min: bool,
    pub case_temp_above_max: bool,
    /// Expressed in `temperature_unit`
    pub case_temperature: f64,
    pub temperature_unit: TemperatureUnit,
    /// The case's echo of the battery level the phone last reported
    pub phone_battery_percent_echo: u8,
    pub solar_current_milliamps: u16,
}

/// Charger configuration decoded from a 0x03 response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargerConfig {
    pub enabled: bool,
}

/// A decoded notification, dispatched on its leading opcode
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    Status(PowerBankStatus),
    ChargerConfig(ChargerConfig),
    /// Password, enable-charging and stop-charging replies carry nothing else
    Acknowledged(Opcode),
    /// History and today replies; recognised, payload left to the caller
    Report(Opcode),
    Unrecognized(u8),
}

impl DeviceResponse {
    pub fn opcode_byte(&self) -> u8 {
        match self {
            Self::Status(_) => Opcode::QueryStatus.as_byte(),
            Self::ChargerConfig(_) => Opcode::ChargerConfig.as_byte(),
            Self::Acknowledged(opcode) | Self::Report(opcode) => opcode.as_byte(),
            Self::Unrecognized(byte) => *byte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("response 0x{opcode:02x} too short: expected at least {expected} bytes, got {actual}")]
    TooShort { opcode: u8, expected: usize, actual: usize },
    #[error("unexpected opcode 0x{actual:02x}, expected 0x{expected:02x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },
}

const FLAG_SOLAR_CHARGING: u8 = 1 << 0;
const FLAG_USB_CHARGING: u8 = 1 << 1;
const FLAG_PHONE_CHARGING: u8 = 1 << 2;
const FLAG_VOLTAGE_BELOW_MIN: u8 = 1 << 3;
const FLAG_VOLTAGE_ABOVE_MAX: u8 = 1 << 4;
const FLAG_TEMP_BELOW_MIN: u8 = 1 << 5;
const FLAG_TEMP_ABOVE_MAX: u8 = 1 << 6;

/// Decodes a status (0x04) response.
///
/// Layout:
///
/// Byte | Meaning
/// 0    | opcode 0x04
/// 1-2  | case battery voltage, mV, little-endian
/// 3    | case battery percent
/// 4    | flags (solar, usb, phone, V low, V high, T low, T high from bit 0)
/// 5    | case temperature, Celsius
/// 6    | reserved
/// 7    | phone battery percent echo
/// 8-9  | solar current, mA, little-endian
pub fn decode_status(data: &[u8], unit: TemperatureUnit) -> Result<PowerBankStatus, DecodeError> {
    let opcode = *data.first().ok_or(DecodeError::Empty)?;
    if opcode != Opcode::QueryStatus.as_byte() {
        return Err(DecodeError::UnexpectedOpcode {
            expected: Opcode::QueryStatus.as_byte(),
            actual: opcode,
        });
    }
    if data.len() < STATUS_RESPONSE_MIN_LEN {
        return Err(DecodeError::TooShort {
            opcode,
            expected: STATUS_RESPONSE_MIN_LEN,
            actual: data.len(),
        });
    }

    let flags = data[4];
    Ok(PowerBankStatus {
        case_battery_voltage_millivolts: u16::from_le_bytes([data[1], data[2]]),
        case_battery_percent: data[3],
        solar_charging: flags & FLAG_SOLAR_CHARGING != 0,
        usb_charging: flags & FLAG_USB_CHARGING != 0,
        phone_charging: flags & FLAG_PHONE_CHARGING != 0,
        case_voltage_below_min: flags & FLAG_VOLTAGE_BELOW_MIN != 0,
        case_voltage_above_max: flags & FLAG_VOLTAGE_ABOVE_MAX != 0,
        case_temp_below_min: flags & FLAG_TEMP_BELOW_MIN != 0,
        case_temp_above_max: flags & FLAG_TEMP_ABOVE_MAX != 0,
        case_temperature: unit.from_celsius(data[5] as f64),
        temperature_unit: unit,
        phone_battery_percent_echo: data[7],
        solar_current_milliamps: u16::from_le_bytes([data[8], data[9]]),
    })
}

fn decode_charger_config(data: &[u8]) -> Result<ChargerConfig, DecodeError> {
    if data.len() < CHARGER_CONFIG_RESPONSE_MIN_LEN {
        return Err(DecodeError::TooShort {
            opcode: Opcode::ChargerConfig.as_byte(),
            expected: CHARGER_CONFIG_RESPONSE_MIN_LEN,
            actual: data.len(),
        });
    }
    Ok(ChargerConfig { enabled: data[5] == 1 })
}

/// Decodes any notification payload by its leading opcode
pub fn decode_response(data: &[u8], unit: TemperatureUnit) -> Result<DeviceResponse, DecodeError> {
    let first = *data.first().ok_or(DecodeError::Empty)?;
    let Ok(opcode) = Opcode::try_from(first) else {
        return Ok(DeviceResponse::Unrecognized(first));
    };

    match opcode {
        Opcode::QueryStatus => decode_status(data, unit).map(DeviceResponse::Status),
        Opcode::ChargerConfig => decode_charger_config(data).map(DeviceResponse::ChargerConfig),
        Opcode::Authenticate | Opcode::EnablePhoneCharging | Opcode::StopCharging => {
            Ok(DeviceResponse::Acknowledged(opcode))
        }
        Opcode::SolarHistory | Opcode::UsbHistory | Opcode::PhoneHistory | Opcode::TodayStatus => {
            Ok(DeviceResponse::Report(opcode))
        }
    }
}
