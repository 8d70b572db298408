//! Device side of the session protocol
//!
//! [`DeviceLink`] speaks to the relay; [`DeviceRunner`] connects it to a
//! microphone (or WAV file) through the voice activity controller.

mod link;
mod runner;
mod source;

pub use link::{DeviceLink, DeviceLinkConfig, LinkEvent, SessionInfo};
pub use runner::{DeviceRunner, RunSummary};
#[cfg(feature = "mic")]
pub use source::MicSource;
pub use source::{SampleSource, WavSource, pcm_to_wav};
