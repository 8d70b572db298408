//! Device-side voice activity detection
//!
//! Decides locally, without a server round-trip, when to start and stop
//! streaming an utterance.

mod controller;
mod trigger;

pub use controller::{
    EndReason, Utterance, VadConfig, VadEvent, VoiceActivityController, VoiceSessionState,
    samples_to_pcm,
};
pub use trigger::{TriggerSource, WakeWordModel, normalize_phrase, rms_energy};
