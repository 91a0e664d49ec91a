use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::measurement::Reading;
use crate::rawframe::{RawFrame, FRAME_LEN};
use crate::transport::TransportError;

pub mod codec;
pub mod conv;
pub mod gatt;

/// Reasons a measurement frame is rejected.
///
/// A rejected frame never yields a partial [`Reading`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid frame length: {} bytes, expected {}", _0, FRAME_LEN)]
    InvalidLength(usize),
    #[error("Unknown scale code: {}", _0)]
    UnknownScale(u8),
    #[error("Unknown function code: {}", _0)]
    UnknownFunction(u8),
}

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {:?}", _0)]
    Io(#[from] std::io::Error),

    #[error("Decode error: {}", _0)]
    Decode(#[from] DecodeError),

    #[error("Transport error: {}", _0)]
    Transport(#[from] TransportError),

    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {}", _0)]
    Ble(#[from] btleplug::Error),

    #[error("Connection was closed")]
    Abort,
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Decode one measurement notification.
pub fn decode(
    bytes: &[u8],
    captured_at: DateTime<Utc>,
) -> std::result::Result<Reading, DecodeError> {
    let raw = RawFrame::try_from(bytes)?;
    Reading::try_from((raw, captured_at))
}

/// Encode a reading into the notification layout.
pub fn encode(reading: &Reading) -> [u8; FRAME_LEN] {
    RawFrame::from(reading).to_bytes()
}
