//! Length-prefixed framing.
//!
//! Envelopes and media samples are framed with a 4-byte big-endian length
//! prefix followed by the payload:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  payload         |
//! +----------------+------------------+
//! ```
//!
//! Raw transfer bytes that follow an image or file envelope are *not*
//! framed.

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Prefixes `payload` with its length.
///
/// # Example
///
/// ```rust
/// use parley_protocol::encode_frame;
///
/// let bytes = encode_frame(b"hi").unwrap();
/// assert_eq!(bytes, [0, 0, 0, 2, b'h', b'i']);
/// ```
pub fn encode_frame(payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Reads the payload length out of a frame header, enforcing the size limit.
pub fn frame_length(header: [u8; FRAME_HEADER_LEN]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len as usize)
}

/// Returns the payload of one complete frame at the start of `data`.
pub fn decode_frame(data: &[u8]) -> ProtocolResult<&[u8]> {
    let Some(header) = data.first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: FRAME_HEADER_LEN,
            received: data.len(),
        });
    };
    let len = frame_length(*header)?;

    let end = FRAME_HEADER_LEN + len;
    if data.len() < end {
        return Err(ProtocolError::IncompleteMessage {
            expected: end,
            received: data.len(),
        });
    }
    Ok(&data[FRAME_HEADER_LEN..end])
}
