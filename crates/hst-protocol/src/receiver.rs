//! Background receiver: owns the serial input and publishes decoded payloads

use crate::framer::FrameDecoder;

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of payloads retained; only the newest one matters to a transaction
pub const RING_CAPACITY: usize = 2;

/// Size of a single read from the port
const READ_CHUNK: usize = 1024;

/// A payload and the moment it was extracted from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub timestamp: Instant,
    pub payload: Vec<u8>,
}

/// Fixed-capacity history of received payloads
///
/// Written by the receiver thread, read by the transaction layer. Append
/// (with eviction of the oldest record) and read-newest each happen under
/// a single lock, so a reader never observes a half-updated ring.
#[derive(Debug)]
pub struct MessageRing {
    records: Mutex<VecDeque<Arc<MessageRecord>>>,
    capacity: usize,
}

impl Default for MessageRing {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRing {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<MessageRecord>>> {
        // Records are immutable once stored, so a panicked writer cannot
        // leave the deque in a torn state
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&self, record: MessageRecord) {
        let mut records = self.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(Arc::new(record));
    }

    /// Stamp a payload with the current time and append it
    pub fn publish(&self, payload: Vec<u8>) {
        self.push(MessageRecord {
            timestamp: Instant::now(),
            payload,
        });
    }

    /// The most recently received record
    pub fn latest(&self) -> Option<Arc<MessageRecord>> {
        self.lock().back().cloned()
    }

    /// The newest record received strictly after `since`
    pub fn latest_since(&self, since: Instant) -> Option<Arc<MessageRecord>> {
        self.latest().filter(|record| record.timestamp > since)
    }

    /// All retained records, oldest first
    pub fn snapshot(&self) -> Vec<Arc<MessageRecord>> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Handle to the receiver thread
///
/// The thread exits when [`Receiver::stop`] is called, on EOF, or on a hard
/// read error. The reader must return periodically (e.g. a port with a read
/// timeout) for a stop request to be noticed.
pub struct Receiver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Spawn the receive loop on its own thread
    #[allow(clippy::missing_errors_doc)]
    pub fn spawn<R>(reader: R, ring: Arc<MessageRing>) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("hst-receiver".to_string())
            .spawn(move || Self::receive_loop(reader, &ring, &stop_flag))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the receive loop is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the loop to exit and wait for it; safe to call more than once
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Receiver thread panicked");
            }
        }
    }

    /// Receive loop - runs in a standard thread with blocking I/O
    fn receive_loop<R: Read>(mut reader: R, ring: &MessageRing, stop: &AtomicBool) {
        tracing::debug!("Receiver thread started");
        let mut buffer = [0u8; READ_CHUNK];
        let mut decoder = FrameDecoder::new();

        while !stop.load(Ordering::SeqCst) {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("Serial port closed");
                    break;
                }
                Ok(n) => {
                    tracing::debug!("Read {} bytes: {:02X?}", n, &buffer[..n]);
                    for payload in decoder.feed(&buffer[..n]) {
                        tracing::debug!("Decoded payload: {:02X?}", &payload);
                        ring.publish(payload);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Receiver thread shutting down");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}
