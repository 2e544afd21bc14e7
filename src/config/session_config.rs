use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::bluetooth::constants::{
    DEFAULT_HANDSHAKE_SETTLE_MS, DEFAULT_PHONE_BATTERY_PERCENT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_VERIFICATION_TIMEOUT_MS,
};
use crate::core::power_bank::TemperatureUnit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connect to the first matching device as soon as it is discovered.
    pub auto_connect: bool,

    /// Unit the case temperature is reported in.
    pub temperature_unit: TemperatureUnit,

    /// Delay after subscribing before the password is sent (ms).
    pub handshake_settle_ms: u64,

    /// Status poll interval while connected (ms).
    pub poll_interval_ms: u64,

    /// A steady session that decodes no status within this window is dropped (ms).
    /// 0 disables the check.
    pub verification_timeout_ms: u64,

    /// Battery level reported to the case when the phone's level cannot be read.
    pub fallback_phone_battery_percent: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            auto_connect: true,
            temperature_unit: TemperatureUnit::Celsius,
            handshake_settle_ms: DEFAULT_HANDSHAKE_SETTLE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            verification_timeout_ms: DEFAULT_VERIFICATION_TIMEOUT_MS,
            fallback_phone_battery_percent: DEFAULT_PHONE_BATTERY_PERCENT,
        }
    }
}

impl SessionConfig {
    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn verification_timeout(&self) -> Option<Duration> {
        (self.verification_timeout_ms > 0).then(|| Duration::from_millis(self.verification_timeout_ms))
    }
}
