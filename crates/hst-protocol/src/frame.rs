//! HST frame structure and boundary detection
//!
//! Frame format:
//! ```text
//! [Start marker: 0xAA 0xBB]
//! [Length: 1 byte] (command + data, excluding markers and itself)
//! [Command: 1 byte]
//! [Data: 0..=254 bytes]
//! [End marker: 0xCC 0xDD]
//! ```

use crate::types::ProtocolError;

/// Marks the beginning of a frame
pub const START_MARKER: [u8; 2] = [0xAA, 0xBB];
/// Marks the end of a frame
pub const END_MARKER: [u8; 2] = [0xCC, 0xDD];

/// Largest payload (command + data) the length byte can describe
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;
/// Largest data section a single frame can carry
pub const MAX_DATA_SIZE: usize = MAX_PAYLOAD_SIZE - 1;
/// Markers + length + command
pub const MIN_FRAME_SIZE: usize = START_MARKER.len() + 1 + 1 + END_MARKER.len();

/// Offset of the length byte from the start marker
const LENGTH_OFFSET: usize = START_MARKER.len();
/// Offset of the payload from the start marker
const PAYLOAD_OFFSET: usize = LENGTH_OFFSET + 1;

/// Wrap a command and its data in a frame
#[allow(clippy::missing_errors_doc)]
pub fn encode(command: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let payload_len = data.len() + 1;
    let length = u8::try_from(payload_len).map_err(|_| ProtocolError::EncodingError(payload_len))?;

    let mut frame = Vec::with_capacity(MIN_FRAME_SIZE + data.len());
    frame.extend_from_slice(&START_MARKER);
    frame.push(length);
    frame.push(command);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&END_MARKER);
    Ok(frame)
}

/// Result of scanning the receive buffer once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A frame was found; its payload is returned and everything up to its
    /// end marker was drained from the buffer
    Frame(Vec<u8>),
    /// Buffer left untouched, more bytes are needed
    Incomplete,
    /// No start marker anywhere; the buffer was dropped
    Desync { discarded: usize },
}

/// Byte offsets of every (possibly overlapping) occurrence of `marker`
fn find_marker(buffer: &[u8], marker: [u8; 2]) -> Vec<usize> {
    buffer
        .windows(marker.len())
        .enumerate()
        .filter(|(_, window)| *window == marker)
        .map(|(idx, _)| idx)
        .collect()
}

/// Check whether `buffer[start..end + 2]` is a self-consistent frame
///
/// The length byte must match the distance between the markers, and must be
/// at least 1 since every frame carries a command byte.
fn is_consistent(buffer: &[u8], start: usize, end: usize) -> bool {
    if end < start + PAYLOAD_OFFSET {
        return false;
    }
    let length = usize::from(buffer[start + LENGTH_OFFSET]);
    length > 0 && length == end - start - PAYLOAD_OFFSET
}

/// Extract the first complete frame from `buffer`
///
/// Every start marker is paired with every end marker behind it, earliest
/// start first and, for the same start, earliest end first. The first pair
/// whose length byte agrees with its size wins. Pairs that disagree are
/// false matches (a marker pattern inside data, or a corrupted length) and
/// the search moves on.
///
/// When the buffer holds no start marker at all it is discarded whole.
pub fn scan_and_extract(buffer: &mut Vec<u8>) -> ScanOutcome {
    let starts = find_marker(buffer, START_MARKER);
    if starts.is_empty() {
        let discarded = buffer.len();
        buffer.clear();
        return ScanOutcome::Desync { discarded };
    }

    let ends = find_marker(buffer, END_MARKER);
    if ends.is_empty() {
        return ScanOutcome::Incomplete;
    }

    for &start in &starts {
        for &end in ends.iter().filter(|&&end| end > start) {
            if is_consistent(buffer, start, end) {
                let payload = buffer[start + PAYLOAD_OFFSET..end].to_vec();
                buffer.drain(..end + END_MARKER.len());
                return ScanOutcome::Frame(payload);
            }
        }
    }

    ScanOutcome::Incomplete
}

/// Split a payload into its command byte and data
///
/// Returns `None` for an empty payload.
#[must_use]
pub fn split_payload(payload: &[u8]) -> Option<(u8, &[u8])> {
    payload.split_first().map(|(&command, data)| (command, data))
}
