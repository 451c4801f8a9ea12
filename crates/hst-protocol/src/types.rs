//! Common types used throughout the protocol

use crate::commands::CommandId;
use serde::Serialize;
use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Payload too large: {0} bytes (command + data must fit in 255)")]
    EncodingError(usize),

    #[error("Value out of range: {name}={value} (allowed {min}..={max})")]
    ValueOutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid arguments for {command}: expected {expected}, got {actual}")]
    InvalidArguments {
        command: CommandId,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid PFM selector: {0:?} (valid channels are x, y, z, a)")]
    InvalidPfm(String),

    #[error("Unknown command ID: {0:#04X}")]
    UnknownCommand(u8),

    #[error("Unknown command name: {0}")]
    UnknownCommandName(String),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Empty reply to {0}")]
    EmptyReply(CommandId),

    #[error("Malformed reply to {command}: {reason}")]
    MalformedReply { command: CommandId, reason: String },

    #[error("Device rejected {0} (NACK)")]
    Nack(CommandId),

    #[error("Unexpected reply: sent {expected}, device answered {actual}")]
    UnexpectedReply {
        expected: CommandId,
        actual: CommandId,
    },

    #[error("Request timeout")]
    Timeout,

    #[error("Datalink not connected")]
    NotConnected,

    #[error("Serial port error: {0}")]
    SerialError(#[from] std::io::Error),
}

/// Single-byte reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ack = 0xAA,
    Nack = 0xAB,
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0xAA => Ok(Status::Ack),
            0xAB => Ok(Status::Nack),
            _ => Err(value),
        }
    }
}

/// Rotation direction for `SET_TARGET_FREQ`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Reverse = 0,
    Forward = 1,
}

impl From<bool> for Direction {
    fn from(forward: bool) -> Self {
        if forward {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

/// Raw IMU registers as reported by `GET_IMU_MEASUREMENT`
///
/// Accelerometer, gyroscope and magnetometer, three axes each, in the
/// order they appear on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImuMeasurement {
    pub ax: u16,
    pub ay: u16,
    pub az: u16,
    pub gx: u16,
    pub gy: u16,
    pub gz: u16,
    pub mx: u16,
    pub my: u16,
    pub mz: u16,
}

impl ImuMeasurement {
    /// Wire size of a measurement: 9 fields x 2 bytes
    pub const WIRE_SIZE: usize = 18;

    /// Parse nine little-endian u16 fields
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::MalformedReply {
                command: CommandId::GetImuMeasurement,
                reason: format!(
                    "expected {} bytes of IMU data, got {}",
                    Self::WIRE_SIZE,
                    data.len()
                ),
            });
        }

        let field = |idx: usize| u16::from_le_bytes([data[idx * 2], data[idx * 2 + 1]]);

        Ok(Self {
            ax: field(0),
            ay: field(1),
            az: field(2),
            gx: field(3),
            gy: field(4),
            gz: field(5),
            mx: field(6),
            my: field(7),
            mz: field(8),
        })
    }

    /// The device stores these as `int16_t` before sending; reinterpret them
    #[must_use]
    pub fn as_signed(&self) -> [i16; 9] {
        [
            self.ax, self.ay, self.az, self.gx, self.gy, self.gz, self.mx, self.my, self.mz,
        ]
        .map(|v| v as i16)
    }
}
