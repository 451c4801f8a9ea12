//! HST serial protocol implementation
//!
//! This crate implements the framed serial protocol used to drive the HST
//! motion-control board: packet encoding and boundary detection, a
//! background receiver, and a request/reply transaction layer with the
//! board's command dictionary.

pub mod commands;
pub mod datalink;
pub mod frame;
pub mod framer;
pub mod receiver;
pub mod reply;
pub mod sim;
pub mod types;

pub use commands::{Command, CommandId, Pfm, PfmMask};
pub use datalink::{Datalink, DatalinkConfig, TransactionResult};
pub use frame::{encode, scan_and_extract, split_payload, ScanOutcome};
pub use framer::FrameDecoder;
pub use receiver::{MessageRecord, MessageRing, Receiver};
pub use reply::{Reply, ReplyData};
pub use types::*;
