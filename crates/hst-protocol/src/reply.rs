//! Reply decoding per command

use crate::commands::CommandId;
use crate::frame::split_payload;
use crate::types::{ImuMeasurement, ProtocolError, Status};
use serde::Serialize;

/// Decoded content of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReplyData {
    /// Status-only reply; `true` for ACK
    Ack { ack: bool },
    /// Step counter from `GET_DELTA_STEPS`
    DeltaSteps { delta: i32 },
    /// Registers from `GET_IMU_MEASUREMENT`
    Imu(ImuMeasurement),
    /// Interrupt frequency from `GET_ISR_FREQ`
    IsrFreq { isr_freq: u16 },
}

/// A reply payload decoded against the command it echoes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub command: CommandId,
    #[serde(flatten)]
    pub data: ReplyData,
}

impl Reply {
    /// Decode a payload (command + data) received from the device
    #[allow(clippy::missing_errors_doc)]
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (command_byte, data) = split_payload(payload).ok_or(ProtocolError::EmptyPayload)?;
        let command =
            CommandId::from_u8(command_byte).ok_or(ProtocolError::UnknownCommand(command_byte))?;

        let data = match command {
            CommandId::SetTargetFreq
            | CommandId::SetTargetDelta
            | CommandId::SetIsrFreq
            | CommandId::EnableCnc
            | CommandId::DisableCnc
            | CommandId::SetDeltaSteps
            | CommandId::Stop => {
                let status = *data.first().ok_or(ProtocolError::EmptyReply(command))?;
                ReplyData::Ack {
                    ack: status == Status::Ack as u8,
                }
            }
            CommandId::GetDeltaSteps => match data_or_status(command, data)? {
                Some(data) => {
                    let bytes: [u8; 4] = data.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(
                        || ProtocolError::MalformedReply {
                            command,
                            reason: format!("expected 4 bytes of step count, got {}", data.len()),
                        },
                    )?;
                    ReplyData::DeltaSteps {
                        delta: i32::from_le_bytes(bytes),
                    }
                }
                None => ReplyData::Ack { ack: false },
            },
            CommandId::GetImuMeasurement => match data_or_status(command, data)? {
                Some(data) => ReplyData::Imu(ImuMeasurement::parse(data)?),
                None => ReplyData::Ack { ack: false },
            },
            CommandId::GetIsrFreq => match data_or_status(command, data)? {
                // Device pads the frequency to 4 bytes; the upper two are zero
                Some(data) => ReplyData::IsrFreq {
                    isr_freq: u16::from_le_bytes([data[0], data[1]]),
                },
                None => ReplyData::Ack { ack: false },
            },
        };

        Ok(Self { command, data })
    }

    /// `Some(ack)` for status-only replies
    #[must_use]
    pub fn ack(&self) -> Option<bool> {
        match self.data {
            ReplyData::Ack { ack } => Some(ack),
            _ => None,
        }
    }
}

/// Separate data replies from 1-byte status replies
///
/// More than one byte is data. A single byte must be NACK; any other lone
/// byte cannot be interpreted.
fn data_or_status(command: CommandId, data: &[u8]) -> Result<Option<&[u8]>, ProtocolError> {
    match data {
        [] => Err(ProtocolError::EmptyReply(command)),
        [status] => match Status::try_from(*status) {
            Ok(Status::Nack) => Ok(None),
            _ => Err(ProtocolError::MalformedReply {
                command,
                reason: format!("unexpected status byte {status:#04X}"),
            }),
        },
        data => Ok(Some(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack() {
        let reply = Reply::decode(&[0x01, 0xAA]).unwrap();
        assert_eq!(reply.command, CommandId::SetTargetFreq);
        assert_eq!(reply.ack(), Some(true));
    }

    #[test]
    fn test_nack_and_other_status() {
        let reply = Reply::decode(&[0x06, 0xAB]).unwrap();
        assert_eq!(reply.ack(), Some(false));
        // Anything but ACK is a negative acknowledgment for simple commands
        let reply = Reply::decode(&[0x07, 0x00]).unwrap();
        assert_eq!(reply.ack(), Some(false));
    }

    #[test]
    fn test_stop_is_ack_nack() {
        let reply = Reply::decode(&[0x09, 0xAA]).unwrap();
        assert_eq!(reply.command, CommandId::Stop);
        assert_eq!(reply.ack(), Some(true));
    }

    #[test]
    fn test_empty_status() {
        let result = Reply::decode(&[0x05]);
        assert!(matches!(
            result,
            Err(ProtocolError::EmptyReply(CommandId::SetIsrFreq))
        ));
    }

    #[test]
    fn test_delta_steps() {
        let reply = Reply::decode(&[0x03, 0xFE, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(reply.data, ReplyData::DeltaSteps { delta: -2 });

        let reply = Reply::decode(&[0x03, 0x10, 0x27, 0x00, 0x00]).unwrap();
        assert_eq!(reply.data, ReplyData::DeltaSteps { delta: 10_000 });
    }

    #[test]
    fn test_delta_steps_nack() {
        let reply = Reply::decode(&[0x03, 0xAB]).unwrap();
        assert_eq!(reply.ack(), Some(false));
    }

    #[test]
    fn test_delta_steps_bad_status() {
        assert!(matches!(
            Reply::decode(&[0x03, 0xAA]),
            Err(ProtocolError::MalformedReply { .. })
        ));
        assert!(matches!(
            Reply::decode(&[0x03, 0x01, 0x02]),
            Err(ProtocolError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_imu() {
        let reply =
            Reply::decode(&[0x04, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0, 7, 0, 8, 0, 9, 0]).unwrap();
        let ReplyData::Imu(imu) = reply.data else {
            panic!("expected IMU data, got {:?}", reply.data);
        };
        assert_eq!(
            imu,
            ImuMeasurement {
                ax: 1,
                ay: 2,
                az: 3,
                gx: 4,
                gy: 5,
                gz: 6,
                mx: 7,
                my: 8,
                mz: 9,
            }
        );
    }

    #[test]
    fn test_imu_nack() {
        let reply = Reply::decode(&[0x04, 0xAB]).unwrap();
        assert_eq!(reply.ack(), Some(false));
    }

    #[test]
    fn test_isr_freq() {
        let reply = Reply::decode(&[0x0A, 0x00, 0x19, 0x00, 0x00]).unwrap();
        assert_eq!(reply.data, ReplyData::IsrFreq { isr_freq: 6400 });
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Reply::decode(&[0x42, 0xAA]),
            Err(ProtocolError::UnknownCommand(0x42))
        ));
    }

    #[test]
    fn test_serialize_fields() {
        let reply = Reply::decode(&[0x01, 0xAA]).unwrap();
        let json = serde_json::to_value(reply).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "command": "SET_TARGET_FREQ", "ack": true })
        );

        let reply = Reply::decode(&[0x03, 0x05, 0x00, 0x00, 0x00]).unwrap();
        let json = serde_json::to_value(reply).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "command": "GET_DELTA_STEPS", "delta": 5 })
        );
    }
}
