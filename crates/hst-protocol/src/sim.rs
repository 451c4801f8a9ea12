//! Software stand-in for the motion-control device
//!
//! Answers commands the way the firmware does: payload sizes are checked
//! per command, ACK/NACK for setters, data or NACK for getters. Nothing
//! moves; the PFM registers simply hold what was written.

use crate::commands::CommandId;
use crate::frame::{encode, split_payload};
use crate::framer::FrameDecoder;
use crate::types::{ImuMeasurement, Status};

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

/// Channels the simulated board drives
pub const NUM_PFM: usize = 4;

/// Frequency value the firmware treats as "stopped"
pub const INACTIVE_FREQ: u16 = 65535;

/// Interrupt frequency at power-up
pub const DEFAULT_ISR_FREQ: u16 = 6400;

/// Idle read timeout of the simulated port
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Register state of one PFM channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfmState {
    pub target_freq: u16,
    pub forward: bool,
    pub target_delta: Option<i32>,
    pub delta_steps: i32,
}

impl Default for PfmState {
    fn default() -> Self {
        Self {
            target_freq: INACTIVE_FREQ,
            forward: true,
            target_delta: None,
            delta_steps: 0,
        }
    }
}

/// Simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub pfm: [PfmState; NUM_PFM],
    pub cnc_enabled: bool,
    pub isr_freq: u16,
    pub imu: ImuMeasurement,
    /// When set, commands are processed but no reply is sent
    pub muted: bool,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            pfm: [PfmState::default(); NUM_PFM],
            cnc_enabled: false,
            isr_freq: DEFAULT_ISR_FREQ,
            imu: ImuMeasurement::default(),
            muted: false,
        }
    }

    /// Indices of the channels selected by a PFM bit mask
    fn selected(mask: u8) -> impl Iterator<Item = usize> {
        (0..NUM_PFM).filter(move |idx| mask & (1 << idx) != 0)
    }

    /// Process one request payload and build the reply payload
    ///
    /// Returns `None` for an empty payload; unknown commands are NACKed
    /// with their own command byte echoed.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let (command_byte, data) = split_payload(payload)?;

        let reply_data = match CommandId::from_u8(command_byte) {
            Some(command) => self.execute(command, data),
            None => None,
        }
        .unwrap_or_else(|| vec![Status::Nack as u8]);

        let mut reply = Vec::with_capacity(1 + reply_data.len());
        reply.push(command_byte);
        reply.extend_from_slice(&reply_data);
        Some(reply)
    }

    /// Run a command; `None` means the request was rejected
    fn execute(&mut self, command: CommandId, data: &[u8]) -> Option<Vec<u8>> {
        let ack = || Some(vec![Status::Ack as u8]);

        match (command, data) {
            (CommandId::SetTargetFreq, &[mask, f0, f1, direction]) => {
                let freq = u16::from_le_bytes([f0, f1]);
                for idx in Self::selected(mask) {
                    let pfm = &mut self.pfm[idx];
                    pfm.target_delta = None;
                    pfm.target_freq = freq;
                    pfm.forward = direction != 0;
                }
                ack()
            }
            (CommandId::SetTargetDelta, &[mask, f0, f1, d0, d1, d2, d3]) => {
                let freq = u16::from_le_bytes([f0, f1]);
                let delta = i32::from_le_bytes([d0, d1, d2, d3]);
                for idx in Self::selected(mask) {
                    let pfm = &mut self.pfm[idx];
                    pfm.target_freq = freq;
                    pfm.target_delta = Some(delta);
                }
                ack()
            }
            (CommandId::GetDeltaSteps, &[mask]) => {
                let idx = Self::selected(mask).last()?;
                Some(self.pfm[idx].delta_steps.to_le_bytes().to_vec())
            }
            (CommandId::GetImuMeasurement, &[]) => {
                let imu = self.imu;
                let fields = [
                    imu.ax, imu.ay, imu.az, imu.gx, imu.gy, imu.gz, imu.mx, imu.my, imu.mz,
                ];
                Some(fields.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
            (CommandId::SetIsrFreq, &[f0, f1]) => {
                let freq = u16::from_le_bytes([f0, f1]);
                if freq == 0 {
                    return None;
                }
                self.isr_freq = freq;
                ack()
            }
            (CommandId::GetIsrFreq, &[]) => {
                let mut reply = self.isr_freq.to_le_bytes().to_vec();
                reply.extend_from_slice(&[0x00, 0x00]);
                Some(reply)
            }
            (CommandId::EnableCnc, &[]) => {
                self.cnc_enabled = true;
                ack()
            }
            (CommandId::DisableCnc, &[]) => {
                self.cnc_enabled = false;
                ack()
            }
            (CommandId::SetDeltaSteps, &[mask, d0, d1, d2, d3]) => {
                let delta = i32::from_le_bytes([d0, d1, d2, d3]);
                for idx in Self::selected(mask) {
                    self.pfm[idx].delta_steps = delta;
                }
                ack()
            }
            // The firmware has no STOP handler and rejects it
            (CommandId::Stop, _) => None,
            // Wrong payload size for the command
            _ => None,
        }
    }
}

/// In-memory serial line connected to a [`SimulatedDevice`]
///
/// `writer` and `reader` are the host's ends of the line. Bytes written
/// are framed, handled by the device, and any reply frames become readable.
/// `injector` pushes raw bytes onto the host's receive side, for noise or
/// unsolicited frames.
pub struct SimulatedLink {
    pub reader: SimReader,
    pub writer: SimWriter,
    pub device: Arc<Mutex<SimulatedDevice>>,
    pub injector: mpsc::Sender<Vec<u8>>,
}

impl SimulatedLink {
    pub fn new(device: SimulatedDevice) -> Self {
        let (tx, rx) = mpsc::channel();
        let device = Arc::new(Mutex::new(device));
        Self {
            reader: SimReader {
                rx,
                pending: VecDeque::new(),
            },
            writer: SimWriter {
                device: device.clone(),
                decoder: FrameDecoder::new(),
                tx: tx.clone(),
            },
            device,
            injector: tx,
        }
    }
}

/// Host-side receive end of a [`SimulatedLink`]
///
/// A chunk larger than the caller's buffer is handed out over several reads.
pub struct SimReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(READ_TIMEOUT) {
                // An empty chunk is not end of stream
                Ok(bytes) if bytes.is_empty() => return Err(io::ErrorKind::TimedOut.into()),
                Ok(bytes) => self.pending.extend(bytes),
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        self.pending.read(buf)
    }
}

/// Host-side transmit end of a [`SimulatedLink`]
pub struct SimWriter {
    device: Arc<Mutex<SimulatedDevice>>,
    decoder: FrameDecoder,
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for SimWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for payload in self.decoder.feed(buf) {
            let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(reply) = device.handle_payload(&payload) else {
                continue;
            };
            if device.muted {
                continue;
            }
            let Some((command, data)) = reply.split_first() else {
                continue;
            };
            let frame = encode(*command, data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if self.tx.send(frame).is_err() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
