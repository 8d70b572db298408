//! Binary audio frame codec
//!
//! Every `audio:data` and playback frame carries an 8-byte header:
//! - Bytes 0-1: Magic number `0x5542` (LE)
//! - Bytes 2-3: Stream ID (LE)
//! - Bytes 4-5: Sequence number (LE, wrapping)
//! - Bytes 6-7: Payload length (LE)
//!
//! followed by exactly `length` bytes of PCM.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Magic number identifying an audio frame ("UB")
pub const FRAME_MAGIC: u16 = 0x5542;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Errors decoding a binary frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame shorter than header ({0} bytes)")]
    Truncated(usize),

    #[error("bad magic number {0:#06x}")]
    BadMagic(u16),

    #[error("declared length {declared} but {actual} payload bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload of {0} bytes exceeds frame limit")]
    Oversized(usize),
}

/// A decoded audio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub stream_id: u16,
    pub sequence: u16,
    pub payload: Bytes,
}

impl AudioFrame {
    /// Build a frame, rejecting payloads that do not fit the length field
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Oversized` if the payload exceeds [`MAX_PAYLOAD`]
    pub fn new(stream_id: u16, sequence: u16, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized(payload.len()));
        }
        Ok(Self {
            stream_id,
            sequence,
            payload,
        })
    }

    /// Encode header and payload into a single buffer
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u16_le(FRAME_MAGIC);
        buf.put_u16_le(self.stream_id);
        buf.put_u16_le(self.sequence);
        // Length fits: enforced by `new`
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame, validating magic number and length
    ///
    /// # Errors
    ///
    /// Returns `FrameError` for truncated headers, unknown magic numbers,
    /// or a payload whose size differs from the declared length
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(data.len()));
        }

        let magic = data.get_u16_le();
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let stream_id = data.get_u16_le();
        let sequence = data.get_u16_le();
        let declared = usize::from(data.get_u16_le());

        if data.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        Ok(Self {
            stream_id,
            sequence,
            payload: data,
        })
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Split a buffer into sequential frames of at most `max_payload` bytes
///
/// Returns the frames and the sequence number following the last one.
#[must_use]
pub fn chunk_frames(
    stream_id: u16,
    first_sequence: u16,
    data: &Bytes,
    max_payload: usize,
) -> (Vec<AudioFrame>, u16) {
    let max_payload = max_payload.clamp(1, MAX_PAYLOAD);
    let mut sequence = first_sequence;
    let mut frames = Vec::with_capacity(data.len().div_ceil(max_payload));

    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + max_payload).min(data.len());
        frames.push(AudioFrame {
            stream_id,
            sequence,
            payload: data.slice(offset..end),
        });
        sequence = sequence.wrapping_add(1);
        offset = end;
    }

    (frames, sequence)
}
