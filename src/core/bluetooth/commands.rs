//! iPowerUp command implementation
//! This module contains all the commands that can be sent to the case and
//! the fixed byte layout each of them is encoded to.

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::core::bluetooth::constants::{COMMAND_FRAME_SIZE, PASSWORD_BYTES, PASSWORD_FRAME_SIZE};

/// First byte of every command and response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    ChargerConfig = 0x03,
    QueryStatus = 0x04,
    SolarHistory = 0x05,
    UsbHistory = 0x06,
    PhoneHistory = 0x07,
    TodayStatus = 0x08,
    StopCharging = 0x18,
    Authenticate = 0x19,
    EnablePhoneCharging = 0x21,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::ChargerConfig),
            0x04 => Ok(Self::QueryStatus),
            0x05 => Ok(Self::SolarHistory),
            0x06 => Ok(Self::UsbHistory),
            0x07 => Ok(Self::PhoneHistory),
            0x08 => Ok(Self::TodayStatus),
            0x18 => Ok(Self::StopCharging),
            0x19 => Ok(Self::Authenticate),
            0x21 => Ok(Self::EnablePhoneCharging),
            other => Err(other),
        }
    }
}

/// Charging source a history query refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeSource {
    Phone,
    Usb,
    Solar,
}

/// Power bank commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerBankCommand {
    /// Send the fixed password (0x19, 4-byte frame)
    Authenticate,
    /// Query the status snapshot (0x04), reporting the phone's own battery level
    QueryStatus { phone_battery_percent: f64 },
    /// Query whether phone charging is enabled (0x03)
    QueryChargerConfig,
    /// Query charging history for one source (0x05 / 0x06 / 0x07)
    ChargingHistory(ChargeSource),
    /// Query today's totals (0x08)
    TodayStatus,
    /// Enable charging the phone from the case (0x21)
    EnablePhoneCharging,
    /// Stop charging (0x18)
    StopCharging,
}

impl PowerBankCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Authenticate => Opcode::Authenticate,
            Self::QueryStatus { .. } => Opcode::QueryStatus,
            Self::QueryChargerConfig => Opcode::ChargerConfig,
            Self::ChargingHistory(ChargeSource::Phone) => Opcode::PhoneHistory,
            Self::ChargingHistory(ChargeSource::Usb) => Opcode::UsbHistory,
            Self::ChargingHistory(ChargeSource::Solar) => Opcode::SolarHistory,
            Self::TodayStatus => Opcode::TodayStatus,
            Self::EnablePhoneCharging => Opcode::EnablePhoneCharging,
            Self::StopCharging => Opcode::StopCharging,
        }
    }

    /// Convert the command to its frame representation
    pub fn to_frame(&self) -> CommandFrame {
        match self {
            Self::Authenticate => {
                let mut bytes = [0u8; COMMAND_FRAME_SIZE];
                bytes[0] = Opcode::Authenticate.as_byte();
                bytes[1..PASSWORD_FRAME_SIZE].copy_from_slice(&PASSWORD_BYTES);
                CommandFrame { bytes, len: PASSWORD_FRAME_SIZE }
            }
            Self::QueryStatus { phone_battery_percent } => {
                let mut frame = CommandFrame::padded(Opcode::QueryStatus);
                let percent = clamp_battery_percent(*phone_battery_percent);
                frame.bytes[7..9].copy_from_slice(&percent.to_le_bytes());
                frame
            }
            other => CommandFrame::padded(other.opcode()),
        }
    }
}

/// Rounds to the nearest integer and clamps into [0, 100]. NaN becomes 0.
pub fn clamp_battery_percent(percent: f64) -> u16 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u16
}

/// An encoded outbound frame. 20 bytes, except the 4-byte password frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; COMMAND_FRAME_SIZE],
    len: usize,
}

impl CommandFrame {
    fn padded(opcode: Opcode) -> Self {
        let mut bytes = [0u8; COMMAND_FRAME_SIZE];
        bytes[0] = opcode.as_byte();
        Self { bytes, len: COMMAND_FRAME_SIZE }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl std::fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandFrame({})", self.to_hex())
    }
}

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender {
    /// Send a command to the case
    async fn send_command(&self, command: PowerBankCommand) -> Result<()>;
}

/// Command executor for the case
pub struct CommandExecutor<T: CommandSender> {
    command_sender: T,
}

impl<T: CommandSender> CommandExecutor<T> {
    /// Create a new CommandExecutor
    pub fn new(command_sender: T) -> Self {
        Self { command_sender }
    }

    /// Authenticate and request the first status snapshot.
    ///
    /// The case needs a moment after the notification subscription before it
    /// accepts the password. No acknowledgement is awaited; the first decoded
    /// status is what proves the link works.
    pub async fn perform_handshake(&self, settle: Duration, phone_battery_percent: f64) -> Result<()> {
        debug!("Waiting {:?} for the case to settle", settle);
        sleep(settle).await;

        info!("Sending password frame");
        self.command_sender.send_command(PowerBankCommand::Authenticate).await?;

        info!("Sending initial status query");
        self.command_sender
            .send_command(PowerBankCommand::QueryStatus { phone_battery_percent })
            .await?;

        Ok(())
    }
}
