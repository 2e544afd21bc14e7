//! Constants used throughout the application
//! This module contains all the constant values used by the BLE link,
//! such as UUIDs, frame sizes, opcodes and timing defaults.

use uuid::Uuid;

/// The advertised name of the iPowerUp case. Matching is exact.
pub const DEVICE_NAME: &str = "iPowerUp Uno";

/// The UUID of the iPowerUp data service
pub const UUID_POWER_BANK_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// The UUID of the characteristic the phone writes command frames to
pub const UUID_POWER_BANK_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// The UUID of the characteristic the case sends notifications on
pub const UUID_POWER_BANK_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Command packet size in bytes
pub const COMMAND_FRAME_SIZE: usize = 20;

/// Size of the password frame, the one frame that is not padded
pub const PASSWORD_FRAME_SIZE: usize = 4;

/// Fixed password bytes following the 0x19 opcode
pub const PASSWORD_BYTES: [u8; 3] = [0x88, 0x88, 0x88];

/// Minimum length of a status (0x04) response
pub const STATUS_RESPONSE_MIN_LEN: usize = 10;

/// Minimum length of a charger config (0x03) response
pub const CHARGER_CONFIG_RESPONSE_MIN_LEN: usize = 6;

/// How long a scan waits for the adapter to become available
pub const ADAPTER_READY_TIMEOUT_MS: u64 = 5000;

/// Delay between subscribing to notifications and sending the password
pub const DEFAULT_HANDSHAKE_SETTLE_MS: u64 = 1000;

/// Status poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// How long a steady session may go without a decoded status before it is dropped
pub const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 15_000;

/// Phone battery percent reported when the battery source fails
pub const DEFAULT_PHONE_BATTERY_PERCENT: f64 = 50.0;

/// Capacity of the session event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
