//! Reconnect policy and connection state machine
//!
//! Shared by the device link and the upstream gateway client. Transitions
//! are pure: callers pass the current instant and schedule the returned
//! deadline themselves, so backoff behavior is testable without timers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Exponential backoff policy for reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    #[serde(with = "crate::config::millis")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: u32,
    /// Maximum delay cap
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based)
    ///
    /// `min(base_delay * factor^attempt, max_delay)`, saturating on overflow.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.factor.max(1).saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Connection phase of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the owner should do after a failed or lost connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Try again once `at` is reached
    After {
        attempt: u32,
        delay: Duration,
        at: Instant,
    },
    /// Attempts exhausted, link is now in `Error`
    GiveUp,
    /// Link was closed intentionally, do nothing
    Stop,
}

/// Connection state plus reconnect bookkeeping
#[derive(Debug, Clone)]
pub struct ConnectionState {
    state: LinkState,
    attempts: u32,
    next_retry: Option<Instant>,
    closed: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            attempts: 0,
            next_retry: None,
            closed: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Reconnect attempts made since the last successful connection
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    /// Whether a terminal close was requested
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Explicit `connect()` after giving up: fresh retry budget
    pub const fn restart(&mut self) {
        if self.closed {
            return;
        }
        self.attempts = 0;
        self.next_retry = None;
        if matches!(self.state, LinkState::Error) {
            self.state = LinkState::Disconnected;
        }
    }

    /// An attempt is starting; returns false if the link was closed
    pub const fn begin_attempt(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.state = match self.state {
            LinkState::Reconnecting => LinkState::Reconnecting,
            _ => LinkState::Connecting,
        };
        self.next_retry = None;
        true
    }

    /// Connection established: reset the attempt counter
    pub const fn connected(&mut self) {
        if self.closed {
            return;
        }
        self.state = LinkState::Connected;
        self.attempts = 0;
        self.next_retry = None;
    }

    /// Connection dropped or an attempt failed
    ///
    /// `initial` marks a failure of the very first `connect()`, which
    /// leaves the link in `Error` while the retry is pending.
    pub fn failed(&mut self, now: Instant, policy: &ReconnectPolicy, initial: bool) -> Retry {
        if self.closed {
            self.state = LinkState::Disconnected;
            self.next_retry = None;
            return Retry::Stop;
        }

        if self.attempts >= policy.max_attempts {
            self.state = LinkState::Error;
            self.next_retry = None;
            return Retry::GiveUp;
        }

        let attempt = self.attempts;
        let delay = policy.delay_for_attempt(attempt);
        let at = now + delay;
        self.attempts += 1;
        self.next_retry = Some(at);
        self.state = if initial {
            LinkState::Error
        } else {
            LinkState::Reconnecting
        };

        Retry::After { attempt, delay, at }
    }

    /// Intentional disconnect; no further attempts are made
    pub const fn close(&mut self) {
        self.closed = true;
        self.state = LinkState::Disconnected;
        self.next_retry = None;
    }
}
