//! Defines shared data structures for the Bluetooth module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a discovered iPowerUp case
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier, stable for the device during a scan
    pub id: String,
    /// The resolved advertised name
    pub name: String,
    /// The signal strength (RSSI) of the device, once an advertisement has carried one
    pub signal_strength: Option<i16>,
    /// When the device was last advertised
    pub last_seen: DateTime<Utc>,
}

/// Lifecycle of the single device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    ConnectedAwaitingHandshake,
    ConnectedSteady,
    Disconnecting,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedAwaitingHandshake | Self::ConnectedSteady)
    }

    /// States in which a new connection attempt is ignored
    pub fn is_busy_with_link(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ConnectedAwaitingHandshake | Self::ConnectedSteady | Self::Disconnecting
        )
    }
}

/// Power state of the phone's Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// Why a session left the connected states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DisconnectReason {
    Requested,
    LinkLost { detail: String },
    SetupFailed { detail: String },
    VerificationTimeout,
}

/// Represents the state of a successfully connected device.
/// This struct holds the active handles needed for interaction.
#[derive(Clone)]
pub struct ConnectedDeviceState<P, C> {
    pub device_id: String,
    pub name: String,
    /// The device handle, used for disconnecting.
    pub peripheral: P,
    /// The characteristic handle for writing commands to the device.
    pub write_characteristic: C,
    /// The characteristic handle for receiving notifications from the device.
    pub notify_characteristic: C,
}
