//! Utterance start/end state machine
//!
//! Runs entirely on the device. Every frame carries the instant its last
//! sample was captured; all timing decisions are made from those instants,
//! never from a wall clock, so the controller is deterministic under test.

use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::trigger::{TriggerSource, WakeWordModel, normalize_phrase, rms_energy};
use crate::{Error, Result};

/// Voice activity thresholds and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Capture sample rate, used to size the recording buffer
    pub sample_rate: u32,
    /// RMS energy above which a frame counts as speech
    pub energy_threshold: f32,
    /// Start capture on a loud frame while idle
    pub energy_trigger: bool,
    /// RMS energy that counts as a spike when `energy_trigger` is set
    pub trigger_threshold: f32,
    /// Wake phrase the device listens for; an attached model must be
    /// trained on this phrase
    pub wake_word: String,
    /// Minimum model score that counts as a wake phrase
    pub wake_word_sensitivity: f32,
    #[serde(with = "crate::config::millis")]
    pub min_recording: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_recording: Duration,
    #[serde(with = "crate::config::millis")]
    pub silence_timeout: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            energy_threshold: 0.03,
            energy_trigger: false,
            trigger_threshold: 0.15,
            wake_word: "hey bot".to_string(),
            wake_word_sensitivity: 0.5,
            min_recording: Duration::from_millis(500),
            max_recording: Duration::from_secs(10),
            silence_timeout: Duration::from_millis(1_500),
        }
    }
}

impl VadConfig {
    /// Recording buffer capacity in samples
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        let samples = u128::from(self.sample_rate) * self.max_recording.as_millis() / 1_000;
        usize::try_from(samples).unwrap_or(usize::MAX)
    }
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSessionState {
    /// Listening for a trigger
    Idle,
    /// Trigger fired, capture about to begin
    Triggered,
    /// Capturing an utterance
    Recording,
    /// Utterance handed off, waiting for the link
    Processing,
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Silence,
    MaxDuration,
}

/// A completed utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub duration: Duration,
    pub reason: EndReason,
    pub trigger: TriggerSource,
}

impl Utterance {
    /// Little-endian 16-bit PCM
    #[must_use]
    pub fn to_pcm(&self) -> Bytes {
        samples_to_pcm(&self.samples)
    }
}

/// Little-endian 16-bit PCM for any run of samples
#[must_use]
pub fn samples_to_pcm(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Output of the controller for the device link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    /// Begin streaming
    CaptureStarted { source: TriggerSource, at: Instant },
    /// Recording finished
    UtteranceComplete(Utterance),
}

struct Recording {
    source: TriggerSource,
    started_at: Instant,
    last_voice_at: Instant,
    buffer: Vec<i16>,
}

/// Decides when an utterance begins and ends
pub struct VoiceActivityController {
    config: VadConfig,
    state: VoiceSessionState,
    model: Option<Box<dyn WakeWordModel>>,
    button_pressed: bool,
    recording: Option<Recording>,
    capacity: usize,
    last_energy: f32,
}

impl std::fmt::Debug for VoiceActivityController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceActivityController")
            .field("state", &self.state)
            .field("wake_word", &self.model.as_ref().map(|m| m.phrase().to_string()))
            .field("last_energy", &self.last_energy)
            .finish_non_exhaustive()
    }
}

impl VoiceActivityController {
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        let capacity = config.buffer_capacity();
        tracing::debug!(
            wake_word = %normalize_phrase(&config.wake_word),
            capacity,
            "voice activity controller initialized"
        );

        Self {
            config,
            state: VoiceSessionState::Idle,
            model: None,
            button_pressed: false,
            recording: None,
            capacity,
            last_energy: 0.0,
        }
    }

    /// Attach a wake phrase model
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the model listens for a different phrase
    /// than the configured `wake_word`
    pub fn with_wake_word_model(mut self, model: Box<dyn WakeWordModel>) -> Result<Self> {
        let configured = normalize_phrase(&self.config.wake_word);
        let offered = normalize_phrase(model.phrase());
        if configured != offered {
            return Err(Error::Config(format!(
                "wake word model listens for \"{offered}\", configured \"{configured}\""
            )));
        }
        tracing::debug!(wake_word = %configured, "wake word model attached");
        self.model = Some(model);
        Ok(self)
    }

    #[must_use]
    pub const fn state(&self) -> VoiceSessionState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Energy of the most recent frame
    #[must_use]
    pub const fn last_energy(&self) -> f32 {
        self.last_energy
    }

    /// Manual trigger; starts capture immediately when idle
    pub fn press_button(&mut self, at: Instant) -> Option<VadEvent> {
        if self.state != VoiceSessionState::Idle {
            return None;
        }
        self.button_pressed = true;
        self.poll_trigger(&[], at)
    }

    /// Feed one captured frame
    pub fn process_frame(&mut self, samples: &[i16], at: Instant) -> Option<VadEvent> {
        self.last_energy = rms_energy(samples);

        match self.state {
            VoiceSessionState::Idle | VoiceSessionState::Triggered => {
                self.poll_trigger(samples, at)
            }
            VoiceSessionState::Recording => self.record(samples, at),
            VoiceSessionState::Processing => None,
        }
    }

    /// The link has started sending the utterance; listen again
    pub fn acknowledge(&mut self) {
        if self.state == VoiceSessionState::Processing {
            self.state = VoiceSessionState::Idle;
            tracing::trace!("utterance acknowledged, listening");
        }
    }

    /// Drop any capture in progress and return to idle
    pub fn reset(&mut self) {
        self.state = VoiceSessionState::Idle;
        self.recording = None;
        self.button_pressed = false;
        if let Some(model) = self.model.as_mut() {
            model.reset();
        }
    }

    fn poll_trigger(&mut self, samples: &[i16], at: Instant) -> Option<VadEvent> {
        let source = if std::mem::take(&mut self.button_pressed) {
            Some(TriggerSource::Button)
        } else if self.wake_word_heard(samples) {
            Some(TriggerSource::WakeWord)
        } else if self.config.energy_trigger && self.last_energy >= self.config.trigger_threshold {
            Some(TriggerSource::Energy)
        } else {
            None
        }?;

        self.state = VoiceSessionState::Triggered;
        tracing::debug!(?source, energy = self.last_energy, "capture triggered");

        let mut buffer = Vec::with_capacity(self.capacity.min(self.config.sample_rate as usize));
        if source == TriggerSource::Energy {
            buffer.extend_from_slice(&samples[..samples.len().min(self.capacity)]);
        }

        self.recording = Some(Recording {
            source,
            started_at: at,
            last_voice_at: at,
            buffer,
        });
        self.state = VoiceSessionState::Recording;

        Some(VadEvent::CaptureStarted { source, at })
    }

    fn wake_word_heard(&mut self, samples: &[i16]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let sensitivity = self.config.wake_word_sensitivity;
        self.model
            .as_mut()
            .is_some_and(|model| model.score(samples) >= sensitivity)
    }

    fn record(&mut self, samples: &[i16], at: Instant) -> Option<VadEvent> {
        let recording = self.recording.as_mut()?;

        let room = self.capacity.saturating_sub(recording.buffer.len());
        let overflow = samples.len() > room;
        recording
            .buffer
            .extend_from_slice(&samples[..samples.len().min(room)]);

        if self.last_energy >= self.config.energy_threshold {
            recording.last_voice_at = at;
        }

        let elapsed = at.saturating_duration_since(recording.started_at);
        let silence = at.saturating_duration_since(recording.last_voice_at);

        let reason = if overflow || elapsed >= self.config.max_recording {
            EndReason::MaxDuration
        } else if elapsed >= self.config.min_recording && silence >= self.config.silence_timeout {
            EndReason::Silence
        } else {
            return None;
        };

        let recording = self.recording.take()?;
        self.state = VoiceSessionState::Processing;

        tracing::debug!(
            ?reason,
            elapsed_ms = elapsed.as_millis(),
            samples = recording.buffer.len(),
            "utterance complete"
        );

        Some(VadEvent::UtteranceComplete(Utterance {
            samples: recording.buffer,
            duration: elapsed,
            reason,
            trigger: recording.source,
        }))
    }
}
