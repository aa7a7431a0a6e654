//! Reconnect state machine for WebSocket sessions.
//!
//! Holds `{state, attempt}` and exposes pure transition methods so the
//! backoff schedule can be tested without sockets or timers. The owning
//! session keeps the timer handle and calls these transitions from its
//! socket callbacks.
//!
//! ```text
//! Disconnected ─connect─▸ Connecting ─open─▸ Connected
//!       ▴                     │                  │ unexpected close
//!       │                  failed                ▾
//!   disconnect                ▾            Reconnecting ─open─▸ Connected
//!                           Failed ◂── attempts exhausted ──┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Connection state ───────────────────────────────────────────────

/// State of one WebSocket session (STT and TTS each own one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no pending retry.
    Disconnected,
    /// A manual connect is in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Previously connected socket dropped; a retry is scheduled or running.
    Reconnecting,
    /// Gave up. Terminal until an explicit `connect()`.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Policy ─────────────────────────────────────────────────────────

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries allowed after a drop before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base × 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

// ── State machine ──────────────────────────────────────────────────

/// Explicit `{state, attempt}` reconnect machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Manual connect request. Returns `false` (no-op) while a socket is
    /// already opening or open.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                self.state = ConnectionState::Connecting;
                self.attempt = 0;
                true
            }
        }
    }

    /// Socket opened: reset the attempt counter.
    pub fn on_open(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// Connected socket closed without being asked to.
    ///
    /// Returns the delay before the next retry, or `None` once the attempt
    /// budget is spent (state becomes `Failed`). Only meaningful from
    /// `Connected` or `Reconnecting`; other states are left untouched.
    pub fn on_unexpected_close(&mut self) -> Option<Duration> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Reconnecting => self.schedule_retry(),
            _ => None,
        }
    }

    /// A connect attempt failed before the socket opened.
    ///
    /// A failed manual connect is terminal; a failed retry consumes one
    /// more backoff step.
    pub fn on_connect_failed(&mut self) -> Option<Duration> {
        match self.state {
            ConnectionState::Reconnecting => self.schedule_retry(),
            _ => {
                self.state = ConnectionState::Failed;
                None
            }
        }
    }

    /// Local teardown, or an expected close after a stop request.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
    }

    fn schedule_retry(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        Some(delay)
    }
}
