//! Events published by the device session to the UI layer.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::bluetooth::types::{DiscoveredDevice, DisconnectReason, RadioState, SessionState};
use crate::core::power_bank::{ChargerConfig, PowerBankStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    // Discovery
    DeviceFound(DiscoveredDevice),
    DeviceUpdated(DiscoveredDevice),
    ScanStarted,
    ScanStopped,
    BluetoothStateChanged { state: RadioState },
    PermissionError { message: String },
    ScanError { message: String },

    // Connection
    StateChanged { from: SessionState, to: SessionState },
    Connected { device_id: String, name: String },
    ConnectionFailed { device_id: String, message: String },
    ConnectionVerified,
    VerificationTimedOut,
    Disconnected { reason: DisconnectReason },

    // Data
    StatusReceived(PowerBankStatus),
    RawDataReceived { hex: String },
    ParseError { message: String },
    DeviceResponse { opcode: u8, raw: String, length: usize },
    ChargerConfigReceived(ChargerConfig),
    WriteFailed { opcode: u8, message: String },
}

/// Fan-out of session events to any number of subscribers
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // Having nobody listening is normal before the UI attaches.
        if let Err(e) = self.sender.send(event) {
            debug!("No subscriber for session event: {:?}", e.0);
        }
    }
}
