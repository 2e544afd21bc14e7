//! Bluetooth functionality for the iPowerUp case
//! This module handles all bluetooth operations including scanning,
//! connecting, sending commands and receiving status from the case.

pub mod commands;
pub mod connection;
pub mod constants;
pub mod events;
pub mod notification;
pub mod poller;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use commands::{ChargeSource, CommandExecutor, CommandFrame, CommandSender, Opcode, PowerBankCommand};
pub use connection::BluestTransport;
pub use constants::*;
pub use events::{EventEmitter, SessionEvent};
pub use poller::{FixedBatteryLevel, PhoneBatterySource, StatusPoller};
pub use session::{DeviceSession, SessionError};
pub use transport::{Advertisement, BleTransport, GattEndpoints, TransportError};
pub use types::{DisconnectReason, DiscoveredDevice, RadioState, SessionState};
