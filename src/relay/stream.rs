//! Per-device audio stream state

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::protocol::AudioFormat;

/// Identity of a stream as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamContext {
    pub device_id: String,
    pub session_id: String,
    pub stream_id: u16,
    pub format: AudioFormat,
}

/// Stream phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Announced, no audio yet
    Idle,
    Streaming,
    Ended,
}

/// Result of checking a frame's sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// Sequence jumped ahead; `missing` frames never arrived
    Gap { missing: u16 },
    /// Duplicate or older than what was already forwarded
    Stale,
}

/// Totals reported when a stream ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub stream_id: u16,
    pub bytes: u64,
    pub chunks: u64,
    pub gaps: u64,
    pub duration: Duration,
}

/// Why a stream ended without `audio:end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A newer `audio:start` took its place
    Replaced,
    /// The device re-registered on another connection
    Superseded,
    Disconnected,
    /// No audio within the idle timeout
    Idle,
    /// Device missed its heartbeats
    Evicted,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Replaced => "replaced",
            Self::Superseded => "superseded",
            Self::Disconnected => "disconnected",
            Self::Idle => "idle",
            Self::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// One audio stream belonging to one device
#[derive(Debug, Clone)]
pub struct AudioStream {
    context: Arc<StreamContext>,
    state: StreamState,
    next_sequence: u16,
    bytes: u64,
    chunks: u64,
    gaps: u64,
    started_at: Instant,
    last_activity: Instant,
}

impl AudioStream {
    #[must_use]
    pub fn new(context: StreamContext, now: Instant) -> Self {
        Self {
            context: Arc::new(context),
            state: StreamState::Idle,
            next_sequence: 0,
            bytes: 0,
            chunks: 0,
            gaps: 0,
            started_at: now,
            last_activity: now,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<StreamContext> {
        &self.context
    }

    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.context.stream_id
    }

    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Check a frame's sequence and account for it unless stale
    ///
    /// Sequence numbers wrap; a frame up to half the sequence space ahead
    /// of the expected one is a gap, anything behind is stale.
    pub fn accept(&mut self, sequence: u16, len: usize, now: Instant) -> SequenceCheck {
        let ahead = sequence.wrapping_sub(self.next_sequence);
        let check = match ahead {
            0 => SequenceCheck::InOrder,
            n if n < 0x8000 => SequenceCheck::Gap { missing: n },
            _ => return SequenceCheck::Stale,
        };

        if let SequenceCheck::Gap { .. } = check {
            self.gaps += 1;
        }
        self.next_sequence = sequence.wrapping_add(1);
        self.bytes += len as u64;
        self.chunks += 1;
        self.state = StreamState::Streaming;
        self.last_activity = now;
        check
    }

    /// Whether no audio arrived within `timeout`
    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Mark the stream ended and report its totals
    pub fn finish(&mut self, now: Instant) -> StreamSummary {
        self.state = StreamState::Ended;
        StreamSummary {
            stream_id: self.context.stream_id,
            bytes: self.bytes,
            chunks: self.chunks,
            gaps: self.gaps,
            duration: now.saturating_duration_since(self.started_at),
        }
    }
}
