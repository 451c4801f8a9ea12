//! Transaction layer: send a request, wait for the device's answer

use crate::commands::{Command, Pfm, PfmMask};
use crate::frame::encode;
use crate::receiver::{MessageRing, Receiver};
use crate::reply::{Reply, ReplyData};
use crate::types::{Direction, ImuMeasurement, ProtocolError};

use serde::Serialize;
use serial2::SerialPort;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default baud rate of the controller board
pub const BAUD_RATE: u32 = 115200;

/// Default time to wait for a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default delay between checks of the receive ring
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Read timeout on the port, bounds how long a stop request goes unnoticed
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Timing used by the typed request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatalinkConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DatalinkConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Outcome of one transaction
///
/// Serializes flat: `{"received":true,"command":"ENABLE_CNC","ack":true}`.
/// A payload that arrived but could not be decoded has `received` set and
/// carries the decode error instead of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    pub received: bool,
    #[serde(flatten)]
    pub reply: Option<Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransactionResult {
    fn timed_out() -> Self {
        Self {
            received: false,
            reply: None,
            error: None,
        }
    }
}

/// Connection to the device
///
/// Owns the write side of the line and the receiver thread reading the
/// other side. One transaction at a time: the reply is whatever payload
/// arrives first after the request was sent.
pub struct Datalink {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    receiver: Mutex<Option<Receiver>>,
    ring: Arc<MessageRing>,
    config: DatalinkConfig,
}

impl Datalink {
    /// Open a serial port and start receiving
    #[allow(clippy::missing_errors_doc)]
    pub fn connect(path: &str, baudrate: u32) -> Result<Self, ProtocolError> {
        tracing::info!("Connecting to device at {} ({} baud)", path, baudrate);

        let mut port = SerialPort::open(path, baudrate)?;

        // Reads return periodically so the receiver can notice a stop request
        port.set_read_timeout(PORT_READ_TIMEOUT)?;

        // Clone port for the receiver (serial2 supports clone)
        let reader_port = port.try_clone()?;

        let datalink = Self::from_io(reader_port, port)?;
        tracing::info!("Connected to {}", path);
        Ok(datalink)
    }

    /// Build a datalink over any byte stream pair
    ///
    /// The reader is moved onto the receiver thread; it should return
    /// periodically (timeout or would-block) so that `disconnect` can join it.
    pub fn from_io<R, W>(reader: R, writer: W) -> Result<Self, ProtocolError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let ring = Arc::new(MessageRing::new());
        let receiver = Receiver::spawn(reader, ring.clone())?;

        Ok(Self {
            writer: Mutex::new(Some(Box::new(writer))),
            receiver: Mutex::new(Some(receiver)),
            ring,
            config: DatalinkConfig::default(),
        })
    }

    /// Replace the timing used by the typed request methods
    #[must_use]
    pub fn with_config(mut self, config: DatalinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DatalinkConfig {
        &self.config
    }

    /// Serial ports present on this machine
    pub fn available_ports() -> Result<Vec<PathBuf>, ProtocolError> {
        Ok(SerialPort::available_ports()?)
    }

    fn writer(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receiver(&self) -> MutexGuard<'_, Option<Receiver>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the port is open and the receiver still running
    pub fn is_connected(&self) -> bool {
        self.writer().is_some() && self.receiver().as_ref().is_some_and(Receiver::is_running)
    }

    /// Encode and write one frame without waiting for an answer
    pub fn send(&self, command: u8, data: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode(command, data)?;

        let mut guard = self.writer();
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        tracing::debug!("Writing {} bytes: {:02X?}", frame.len(), &frame);
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Send a typed command without waiting for an answer
    pub fn send_command(&self, command: &Command) -> Result<(), ProtocolError> {
        self.send(command.id() as u8, &command.data())
    }

    /// Wait for a payload that arrived strictly after `since`
    ///
    /// `since` must be taken before the request is written, otherwise a fast
    /// reply can be stamped before it and missed. A timeout too large to
    /// represent as a deadline waits without limit.
    pub async fn receive(
        &self,
        since: Instant,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<Vec<u8>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(record) = self.ring.latest_since(since) {
                return Some(record.payload.clone());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return None;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Send a command and wait up to `timeout` for its reply
    pub async fn transact(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<TransactionResult, ProtocolError> {
        self.transact_with(command, timeout, self.config.poll_interval)
            .await
    }

    /// Like [`Datalink::transact`] with an explicit poll interval
    ///
    /// Errors are reserved for failures to send; a missing or undecodable
    /// reply is reported in the result.
    pub async fn transact_with(
        &self,
        command: &Command,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<TransactionResult, ProtocolError> {
        let result = match self.exchange(command, timeout, poll_interval).await? {
            Some(Ok(reply)) => TransactionResult {
                received: true,
                reply: Some(reply),
                error: None,
            },
            Some(Err(e)) => TransactionResult {
                received: true,
                reply: None,
                error: Some(e.to_string()),
            },
            None => TransactionResult::timed_out(),
        };
        Ok(result)
    }

    /// Send, wait, decode; `None` on timeout
    async fn exchange(
        &self,
        command: &Command,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<Result<Reply, ProtocolError>>, ProtocolError> {
        let id = command.id();
        let since = Instant::now();
        self.send_command(command)?;

        let Some(payload) = self.receive(since, timeout, poll_interval).await else {
            tracing::warn!("Timeout waiting for reply to {} after {:?}", id, timeout);
            return Ok(None);
        };

        tracing::debug!("Reply to {}: {:02X?}", id, &payload);
        let decoded = Reply::decode(&payload);
        if let Err(ref e) = decoded {
            tracing::warn!("Failed to decode reply to {}: {}", id, e);
        }
        Ok(Some(decoded))
    }

    /// Transaction with the configured timing, failing on anything but a
    /// positive reply to the same command
    async fn request(&self, command: Command) -> Result<Reply, ProtocolError> {
        let expected = command.id();
        let reply = self
            .exchange(&command, self.config.timeout, self.config.poll_interval)
            .await?
            .ok_or(ProtocolError::Timeout)??;

        if reply.command != expected {
            return Err(ProtocolError::UnexpectedReply {
                expected,
                actual: reply.command,
            });
        }
        if reply.ack() == Some(false) {
            return Err(ProtocolError::Nack(expected));
        }
        Ok(reply)
    }

    /// Run selected PFMs at a constant frequency
    pub async fn set_target_freq(
        &self,
        pfm: PfmMask,
        freq: u16,
        direction: Direction,
    ) -> Result<(), ProtocolError> {
        self.request(Command::SetTargetFreq {
            pfm,
            freq,
            direction,
        })
        .await?;
        Ok(())
    }

    /// Move selected PFMs by a number of steps at the given frequency
    pub async fn set_target_delta(
        &self,
        pfm: PfmMask,
        freq: u16,
        delta: i32,
    ) -> Result<(), ProtocolError> {
        self.request(Command::SetTargetDelta { pfm, freq, delta })
            .await?;
        Ok(())
    }

    /// Read the step counter of one PFM
    pub async fn get_delta_steps(&self, pfm: Pfm) -> Result<i32, ProtocolError> {
        let reply = self.request(Command::GetDeltaSteps { pfm }).await?;
        match reply.data {
            ReplyData::DeltaSteps { delta } => Ok(delta),
            other => Err(unexpected_data(&reply, other)),
        }
    }

    pub async fn get_imu_measurement(&self) -> Result<ImuMeasurement, ProtocolError> {
        let reply = self.request(Command::GetImuMeasurement).await?;
        match reply.data {
            ReplyData::Imu(imu) => Ok(imu),
            other => Err(unexpected_data(&reply, other)),
        }
    }

    pub async fn set_isr_freq(&self, freq: u16) -> Result<(), ProtocolError> {
        self.request(Command::SetIsrFreq { freq }).await?;
        Ok(())
    }

    pub async fn get_isr_freq(&self) -> Result<u16, ProtocolError> {
        let reply = self.request(Command::GetIsrFreq).await?;
        match reply.data {
            ReplyData::IsrFreq { isr_freq } => Ok(isr_freq),
            other => Err(unexpected_data(&reply, other)),
        }
    }

    pub async fn enable_cnc(&self) -> Result<(), ProtocolError> {
        self.request(Command::EnableCnc).await?;
        Ok(())
    }

    pub async fn disable_cnc(&self) -> Result<(), ProtocolError> {
        self.request(Command::DisableCnc).await?;
        Ok(())
    }

    /// Overwrite the step counter of selected PFMs
    pub async fn set_delta_steps(&self, pfm: PfmMask, delta: i32) -> Result<(), ProtocolError> {
        self.request(Command::SetDeltaSteps { pfm, delta }).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ProtocolError> {
        self.request(Command::Stop).await?;
        Ok(())
    }

    /// Stop the receiver and close the port; safe to call more than once
    pub fn disconnect(&self) {
        let receiver = self.receiver().take();
        let writer = self.writer().take();

        if let Some(mut receiver) = receiver {
            receiver.stop();
        }
        if writer.is_some() {
            drop(writer);
            tracing::info!("Disconnected");
        }
    }
}

fn unexpected_data(reply: &Reply, data: ReplyData) -> ProtocolError {
    ProtocolError::MalformedReply {
        command: reply.command,
        reason: format!("unexpected reply content {data:?}"),
    }
}

impl Drop for Datalink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandId;
    use crate::receiver::MessageRecord;
    use crate::sim::{SimulatedDevice, SimulatedLink};

    fn simulated() -> (Datalink, Arc<Mutex<SimulatedDevice>>) {
        let link = SimulatedLink::new(SimulatedDevice::new());
        let datalink = Datalink::from_io(link.reader, link.writer).unwrap();
        (datalink, link.device)
    }

    #[tokio::test]
    async fn test_stale_record_is_ignored() {
        let (datalink, _device) = simulated();
        let since = Instant::now();
        datalink.ring.push(MessageRecord {
            timestamp: since - Duration::from_millis(5),
            payload: vec![0x06, 0xAA],
        });

        let missed = datalink
            .receive(since, Duration::from_millis(20), Duration::from_millis(1))
            .await;
        assert!(missed.is_none());

        datalink.ring.publish(vec![0x07, 0xAA]);
        let payload = datalink
            .receive(since, Duration::from_millis(20), Duration::from_millis(1))
            .await;
        assert_eq!(payload, Some(vec![0x07, 0xAA]));
    }

    #[tokio::test]
    async fn test_transact_ack() {
        let (datalink, _device) = simulated();
        let result = datalink
            .transact(&Command::EnableCnc, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert!(result.received);
        let reply = result.reply.unwrap();
        assert_eq!(reply.command, CommandId::EnableCnc);
        assert_eq!(reply.ack(), Some(true));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_unbounded_timeout() {
        let (datalink, _device) = simulated();
        let result = datalink
            .transact(&Command::EnableCnc, Duration::MAX)
            .await
            .unwrap();
        assert!(result.received);
        assert_eq!(result.reply.unwrap().ack(), Some(true));
    }

    #[tokio::test]
    async fn test_timeout_result_serializes_flat() {
        let (datalink, device) = simulated();
        device.lock().unwrap().muted = true;

        let result = datalink
            .transact(&Command::GetIsrFreq, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(result, TransactionResult::timed_out());
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({ "received": false })
        );
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let (datalink, _device) = simulated();
        assert!(datalink.is_connected());

        datalink.disconnect();
        datalink.disconnect();
        assert!(!datalink.is_connected());

        let result = datalink
            .transact(&Command::Stop, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
    }

    #[test]
    fn test_config_defaults() {
        let config = DatalinkConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }
}
