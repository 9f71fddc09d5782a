//! Length-prefixed CBOR framing for the RPC session stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{BridgeError, BridgeResult};
use std::io::Cursor;

/// Upper bound on a single frame's payload. A write call carries at most one
/// 8 KiB chunk, so anything near this size is a corrupt or hostile stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> BridgeResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> BridgeResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete CBOR-decoded messages.
    ///
    /// Fails with [`BridgeError::InvalidMessage`] if a frame header announces
    /// more than [`MAX_FRAME_LEN`] bytes.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> BridgeResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;
            if len > MAX_FRAME_LEN {
                return Err(BridgeError::InvalidMessage(format!(
                    "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let msg: T = cbor_decode(&self.buffer[4..4 + len])?;
            messages.push(msg);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
