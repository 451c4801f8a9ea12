//! HST command definitions

use crate::types::{Direction, ProtocolError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Command IDs for the HST serial protocol
///
/// The device echoes the command byte in its reply, so the same IDs are
/// used to interpret incoming payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CommandId {
    /// Run the selected PFMs continuously at a frequency
    SetTargetFreq = 0x01,
    /// Run the selected PFMs for a number of steps
    SetTargetDelta = 0x02,
    /// Read the step counter of one PFM
    GetDeltaSteps = 0x03,
    /// Read the averaged IMU registers
    GetImuMeasurement = 0x04,
    /// Set the step interrupt frequency
    SetIsrFreq = 0x05,
    /// Enable the stepper drivers
    EnableCnc = 0x06,
    /// Disable the stepper drivers
    DisableCnc = 0x07,
    /// Overwrite the step counter of the selected PFMs
    SetDeltaSteps = 0x08,
    /// Halt execution and reset device memory
    Stop = 0x09,
    /// Read the step interrupt frequency
    GetIsrFreq = 0x0A,
}

impl CommandId {
    pub const ALL: [CommandId; 10] = [
        CommandId::SetTargetFreq,
        CommandId::SetTargetDelta,
        CommandId::GetDeltaSteps,
        CommandId::GetImuMeasurement,
        CommandId::SetIsrFreq,
        CommandId::EnableCnc,
        CommandId::DisableCnc,
        CommandId::SetDeltaSteps,
        CommandId::Stop,
        CommandId::GetIsrFreq,
    ];

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(CommandId::SetTargetFreq),
            0x02 => Some(CommandId::SetTargetDelta),
            0x03 => Some(CommandId::GetDeltaSteps),
            0x04 => Some(CommandId::GetImuMeasurement),
            0x05 => Some(CommandId::SetIsrFreq),
            0x06 => Some(CommandId::EnableCnc),
            0x07 => Some(CommandId::DisableCnc),
            0x08 => Some(CommandId::SetDeltaSteps),
            0x09 => Some(CommandId::Stop),
            0x0A => Some(CommandId::GetIsrFreq),
            _ => None,
        }
    }

    /// Wire name, e.g. `SET_TARGET_FREQ`
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            CommandId::SetTargetFreq => "SET_TARGET_FREQ",
            CommandId::SetTargetDelta => "SET_TARGET_DELTA",
            CommandId::GetDeltaSteps => "GET_DELTA_STEPS",
            CommandId::GetImuMeasurement => "GET_IMU_MEASUREMENT",
            CommandId::SetIsrFreq => "SET_ISR_FREQ",
            CommandId::EnableCnc => "ENABLE_CNC",
            CommandId::DisableCnc => "DISABLE_CNC",
            CommandId::SetDeltaSteps => "SET_DELTA_STEPS",
            CommandId::Stop => "STOP",
            CommandId::GetIsrFreq => "GET_ISR_FREQ",
        }
    }

    /// Look up a command by name
    ///
    /// Case-insensitive; accepts `-` for `_` and an optional `CMD_` prefix.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_uppercase().replace('-', "_");
        let normalized = normalized.strip_prefix("CMD_").unwrap_or(&normalized);
        Self::ALL.into_iter().find(|cmd| cmd.name() == normalized)
    }

    /// Number of untyped arguments taken by [`Command::from_args`]
    #[must_use]
    pub fn arg_count(&self) -> usize {
        match self {
            CommandId::SetTargetFreq | CommandId::SetTargetDelta => 3,
            CommandId::SetDeltaSteps => 2,
            CommandId::GetDeltaSteps | CommandId::SetIsrFreq => 1,
            CommandId::GetImuMeasurement
            | CommandId::EnableCnc
            | CommandId::DisableCnc
            | CommandId::Stop
            | CommandId::GetIsrFreq => 0,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single pulse-frequency modulator channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pfm {
    X,
    Y,
    Z,
    A,
}

impl Pfm {
    #[must_use]
    pub fn flag(self) -> u8 {
        match self {
            Pfm::X => 0x01,
            Pfm::Y => 0x02,
            Pfm::Z => 0x04,
            Pfm::A => 0x08,
        }
    }

    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Pfm::X),
            'y' => Some(Pfm::Y),
            'z' => Some(Pfm::Z),
            'a' => Some(Pfm::A),
            _ => None,
        }
    }
}

/// Bit set of PFM channels, sent as a single selector byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PfmMask(u8);

impl PfmMask {
    pub const ALL_BITS: u8 = 0x0F;

    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with(self, pfm: Pfm) -> Self {
        Self(self.0 | pfm.flag())
    }

    #[must_use]
    pub fn contains(&self, pfm: Pfm) -> bool {
        self.0 & pfm.flag() != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Build a mask from raw bits; unknown bits or an empty selection are rejected
    #[allow(clippy::missing_errors_doc)]
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits == 0 || bits & !Self::ALL_BITS != 0 {
            return Err(ProtocolError::ValueOutOfRange {
                name: "pfm",
                value: i64::from(bits),
                min: 1,
                max: i64::from(Self::ALL_BITS),
            });
        }
        Ok(Self(bits))
    }

    /// The single channel this mask selects, if exactly one bit is set
    #[must_use]
    pub fn single(&self) -> Option<Pfm> {
        match self.0 {
            0x01 => Some(Pfm::X),
            0x02 => Some(Pfm::Y),
            0x04 => Some(Pfm::Z),
            0x08 => Some(Pfm::A),
            _ => None,
        }
    }
}

impl From<Pfm> for PfmMask {
    fn from(pfm: Pfm) -> Self {
        Self(pfm.flag())
    }
}

impl FromIterator<Pfm> for PfmMask {
    fn from_iter<I: IntoIterator<Item = Pfm>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl FromStr for PfmMask {
    type Err = ProtocolError;

    /// Parse channel letters such as `"x"`, `"xz"` or `"XYZA"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mask = s
            .chars()
            .map(|c| Pfm::from_char(c).ok_or_else(|| ProtocolError::InvalidPfm(s.to_string())))
            .collect::<Result<PfmMask, _>>()?;
        if mask.is_empty() {
            return Err(ProtocolError::InvalidPfm(s.to_string()));
        }
        Ok(mask)
    }
}

/// A typed request
///
/// Each variant carries exactly the arguments its opcode puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetTargetFreq {
        pfm: PfmMask,
        freq: u16,
        direction: Direction,
    },
    SetTargetDelta {
        pfm: PfmMask,
        freq: u16,
        delta: i32,
    },
    GetDeltaSteps {
        pfm: Pfm,
    },
    GetImuMeasurement,
    SetIsrFreq {
        freq: u16,
    },
    EnableCnc,
    DisableCnc,
    SetDeltaSteps {
        pfm: PfmMask,
        delta: i32,
    },
    Stop,
    GetIsrFreq,
}

impl Command {
    #[must_use]
    pub fn id(&self) -> CommandId {
        match self {
            Command::SetTargetFreq { .. } => CommandId::SetTargetFreq,
            Command::SetTargetDelta { .. } => CommandId::SetTargetDelta,
            Command::GetDeltaSteps { .. } => CommandId::GetDeltaSteps,
            Command::GetImuMeasurement => CommandId::GetImuMeasurement,
            Command::SetIsrFreq { .. } => CommandId::SetIsrFreq,
            Command::EnableCnc => CommandId::EnableCnc,
            Command::DisableCnc => CommandId::DisableCnc,
            Command::SetDeltaSteps { .. } => CommandId::SetDeltaSteps,
            Command::Stop => CommandId::Stop,
            Command::GetIsrFreq => CommandId::GetIsrFreq,
        }
    }

    /// Serialize the arguments (the DATA part of the payload)
    ///
    /// All multi-byte fields are little-endian.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(7);
        match *self {
            Command::SetTargetFreq {
                pfm,
                freq,
                direction,
            } => {
                data.push(pfm.bits());
                data.extend_from_slice(&freq.to_le_bytes());
                data.push(direction as u8);
            }
            Command::SetTargetDelta { pfm, freq, delta } => {
                data.push(pfm.bits());
                data.extend_from_slice(&freq.to_le_bytes());
                data.extend_from_slice(&delta.to_le_bytes());
            }
            Command::GetDeltaSteps { pfm } => data.push(pfm.flag()),
            Command::SetIsrFreq { freq } => data.extend_from_slice(&freq.to_le_bytes()),
            Command::SetDeltaSteps { pfm, delta } => {
                data.push(pfm.bits());
                data.extend_from_slice(&delta.to_le_bytes());
            }
            Command::GetImuMeasurement
            | Command::EnableCnc
            | Command::DisableCnc
            | Command::Stop
            | Command::GetIsrFreq => {}
        }
        data
    }

    /// Build a command from its name and untyped integer arguments
    ///
    /// Argument order follows the wire layout: PFM selector first (as a
    /// bit mask), then frequency, then direction or delta. Every value is
    /// checked against its field width before anything is encoded.
    #[allow(clippy::missing_errors_doc)]
    pub fn from_args(name: &str, args: &[i64]) -> Result<Self, ProtocolError> {
        let id = CommandId::from_name(name)
            .ok_or_else(|| ProtocolError::UnknownCommandName(name.to_string()))?;

        if args.len() != id.arg_count() {
            return Err(ProtocolError::InvalidArguments {
                command: id,
                expected: id.arg_count(),
                actual: args.len(),
            });
        }

        let command = match id {
            CommandId::SetTargetFreq => Command::SetTargetFreq {
                pfm: pfm_mask_arg(args[0])?,
                freq: checked("freq", args[1])?,
                direction: match args[2] {
                    flag @ (0 | 1) => Direction::from(flag == 1),
                    other => return Err(out_of_range("direction", other, 0, 1)),
                },
            },
            CommandId::SetTargetDelta => Command::SetTargetDelta {
                pfm: pfm_mask_arg(args[0])?,
                freq: checked("freq", args[1])?,
                delta: checked("delta", args[2])?,
            },
            CommandId::GetDeltaSteps => {
                let mask = pfm_mask_arg(args[0])?;
                let pfm = mask
                    .single()
                    .ok_or_else(|| ProtocolError::InvalidPfm(format!("{:#04x}", mask.bits())))?;
                Command::GetDeltaSteps { pfm }
            }
            CommandId::GetImuMeasurement => Command::GetImuMeasurement,
            CommandId::SetIsrFreq => Command::SetIsrFreq {
                freq: checked("freq", args[0])?,
            },
            CommandId::EnableCnc => Command::EnableCnc,
            CommandId::DisableCnc => Command::DisableCnc,
            CommandId::SetDeltaSteps => Command::SetDeltaSteps {
                pfm: pfm_mask_arg(args[0])?,
                delta: checked("delta", args[1])?,
            },
            CommandId::Stop => Command::Stop,
            CommandId::GetIsrFreq => Command::GetIsrFreq,
        };

        Ok(command)
    }
}

fn out_of_range(name: &'static str, value: i64, min: i64, max: i64) -> ProtocolError {
    ProtocolError::ValueOutOfRange {
        name,
        value,
        min,
        max,
    }
}

/// Narrow an argument to its field type, reporting the field's bounds on failure
fn checked<T>(name: &'static str, value: i64) -> Result<T, ProtocolError>
where
    T: TryFrom<i64> + Bounded,
{
    T::try_from(value).map_err(|_| out_of_range(name, value, T::MIN_I64, T::MAX_I64))
}

fn pfm_mask_arg(value: i64) -> Result<PfmMask, ProtocolError> {
    let bits: u8 = checked("pfm", value)?;
    PfmMask::from_bits(bits)
}

trait Bounded {
    const MIN_I64: i64;
    const MAX_I64: i64;
}

macro_rules! impl_bounded {
    ($($t:ty),*) => {
        $(impl Bounded for $t {
            const MIN_I64: i64 = <$t>::MIN as i64;
            const MAX_I64: i64 = <$t>::MAX as i64;
        })*
    };
}

impl_bounded!(u8, u16, i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_roundtrip() {
        for id in CommandId::ALL {
            assert_eq!(CommandId::from_u8(id as u8), Some(id));
            assert_eq!(CommandId::from_name(id.name()), Some(id));
        }
        assert_eq!(CommandId::from_u8(0x00), None);
        assert_eq!(CommandId::from_u8(0x0B), None);
    }

    #[test]
    fn test_command_name_variants() {
        assert_eq!(
            CommandId::from_name("cmd_get_imu_measurement"),
            Some(CommandId::GetImuMeasurement)
        );
        assert_eq!(
            CommandId::from_name("set-target-freq"),
            Some(CommandId::SetTargetFreq)
        );
        assert_eq!(CommandId::from_name("reboot"), None);
    }

    #[test]
    fn test_pfm_mask_parse() {
        let mask: PfmMask = "xz".parse().unwrap();
        assert_eq!(mask.bits(), 0x05);
        assert!(mask.contains(Pfm::X));
        assert!(!mask.contains(Pfm::Y));

        let all: PfmMask = "XYZA".parse().unwrap();
        assert_eq!(all.bits(), 0x0F);

        assert!(matches!(
            "xq".parse::<PfmMask>(),
            Err(ProtocolError::InvalidPfm(_))
        ));
        assert!("".parse::<PfmMask>().is_err());
    }

    #[test]
    fn test_pfm_mask_from_bits() {
        assert_eq!(PfmMask::from_bits(0x08).unwrap().single(), Some(Pfm::A));
        assert!(PfmMask::from_bits(0x00).is_err());
        assert!(PfmMask::from_bits(0x10).is_err());
        assert_eq!(PfmMask::from_bits(0x03).unwrap().single(), None);
    }

    #[test]
    fn test_set_target_freq_layout() {
        let cmd = Command::SetTargetFreq {
            pfm: Pfm::Y.into(),
            freq: 0x1234,
            direction: Direction::Forward,
        };
        assert_eq!(cmd.id() as u8, 0x01);
        assert_eq!(cmd.data(), vec![0x02, 0x34, 0x12, 0x01]);
    }

    #[test]
    fn test_set_target_delta_layout() {
        let cmd = Command::SetTargetDelta {
            pfm: [Pfm::X, Pfm::Z].into_iter().collect(),
            freq: 6400,
            delta: -2,
        };
        assert_eq!(cmd.data(), vec![0x05, 0x00, 0x19, 0xFE, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_set_delta_steps_layout() {
        let cmd = Command::SetDeltaSteps {
            pfm: Pfm::A.into(),
            delta: 0x0102_0304,
        };
        assert_eq!(cmd.data(), vec![0x08, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_argless_commands_have_no_data() {
        for cmd in [
            Command::GetImuMeasurement,
            Command::EnableCnc,
            Command::DisableCnc,
            Command::Stop,
            Command::GetIsrFreq,
        ] {
            assert!(cmd.data().is_empty());
        }
    }

    #[test]
    fn test_from_args() {
        let cmd = Command::from_args("SET_TARGET_FREQ", &[1, 7, 1]).unwrap();
        assert_eq!(
            cmd,
            Command::SetTargetFreq {
                pfm: Pfm::X.into(),
                freq: 7,
                direction: Direction::Forward,
            }
        );

        let cmd = Command::from_args("SET_TARGET_FREQ", &[3, 7, 0]).unwrap();
        assert_eq!(cmd.data(), vec![0x03, 0x07, 0x00, 0x00]);

        let cmd = Command::from_args("get_delta_steps", &[4]).unwrap();
        assert_eq!(cmd, Command::GetDeltaSteps { pfm: Pfm::Z });

        let cmd = Command::from_args("set_isr_freq", &[6400]).unwrap();
        assert_eq!(cmd, Command::SetIsrFreq { freq: 6400 });
    }

    #[test]
    fn test_from_args_out_of_range() {
        let err = Command::from_args("SET_ISR_FREQ", &[70_000]).unwrap_err();
        match err {
            ProtocolError::ValueOutOfRange {
                name,
                value,
                min,
                max,
            } => {
                assert_eq!(name, "freq");
                assert_eq!(value, 70_000);
                assert_eq!(min, 0);
                assert_eq!(max, 65_535);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(matches!(
            Command::from_args("SET_DELTA_STEPS", &[1, i64::from(i32::MAX) + 1]),
            Err(ProtocolError::ValueOutOfRange { name: "delta", .. })
        ));
        assert!(matches!(
            Command::from_args("SET_TARGET_FREQ", &[1, 100, 2]),
            Err(ProtocolError::ValueOutOfRange {
                name: "direction",
                ..
            })
        ));
        assert!(matches!(
            Command::from_args("SET_TARGET_FREQ", &[0x10, 100, 0]),
            Err(ProtocolError::ValueOutOfRange { name: "pfm", .. })
        ));
    }

    #[test]
    fn test_from_args_arity_and_names() {
        assert!(matches!(
            Command::from_args("ENABLE_CNC", &[1]),
            Err(ProtocolError::InvalidArguments {
                expected: 0,
                actual: 1,
                ..
            })
        ));
        assert!(matches!(
            Command::from_args("FLY", &[]),
            Err(ProtocolError::UnknownCommandName(_))
        ));
        // Per-channel query must select exactly one PFM
        assert!(matches!(
            Command::from_args("GET_DELTA_STEPS", &[0x03]),
            Err(ProtocolError::InvalidPfm(_))
        ));
    }
}
