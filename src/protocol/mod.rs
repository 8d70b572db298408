//! Session protocol shared by devices and the relay
//!
//! JSON control messages travel as text frames, audio as binary frames
//! with a fixed 8-byte header.

mod frame;
mod message;

pub use frame::{AudioFrame, FRAME_MAGIC, FrameError, HEADER_SIZE, MAX_PAYLOAD, chunk_frames};
pub use message::{
    AudioEndPayload, AudioFormat, AudioResponsePayload, AudioStartPayload, Capabilities,
    CommandPayload, DeviceStatus, ErrorCode, ErrorPayload, Message, RegisterPayload,
    RegisteredPayload,
};
