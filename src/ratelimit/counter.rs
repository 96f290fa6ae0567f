//! Fixed-window counter records.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Length of a counting window, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Window(u64);

impl Window {
    /// Window of `seconds`, rejecting zero.
    pub fn from_secs(seconds: u64) -> Result<Self> {
        Self::try_from(seconds)
    }

    /// Window length in seconds.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Window length as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    /// Absolute expiry of a window opened at `now`.
    pub fn expiry_from(&self, now: i64) -> i64 {
        now.saturating_add(self.0 as i64)
    }
}

impl TryFrom<u64> for Window {
    type Error = TurnstileError;

    fn try_from(seconds: u64) -> Result<Self> {
        if seconds == 0 {
            return Err(TurnstileError::Config(
                "window must be at least one second".to_string(),
            ));
        }
        if seconds > i64::MAX as u64 {
            return Err(TurnstileError::Config(format!(
                "window of {} seconds is out of range",
                seconds
            )));
        }
        Ok(Self(seconds))
    }
}

impl From<Window> for u64 {
    fn from(window: Window) -> Self {
        window.0
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// A counter as held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Operations counted in the current window
    pub count: u64,
    /// Unix timestamp (seconds) at which the window closes
    pub expires_at: i64,
}

impl CounterRecord {
    /// A fresh window holding its first operation.
    pub fn open(now: i64, window: Window) -> Self {
        Self {
            count: 1,
            expires_at: window.expiry_from(now),
        }
    }

    /// Whether the window has closed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Count one more operation, opening a new window if this one has closed.
    pub fn hit(&mut self, now: i64, window: Window) {
        if self.is_expired(now) {
            *self = Self::open(now, window);
        } else {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Seconds left before the window closes, never negative.
    pub fn ttl(&self, now: i64) -> u64 {
        self.expires_at.saturating_sub(now).max(0) as u64
    }
}

/// Outcome of a single backend update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Post-increment count
    pub count: u64,
    /// Whether `count` went past the limit
    pub exceeded: bool,
    /// Operations left in the window
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: i64,
}

impl CounterUpdate {
    /// Derive the decision fields from a post-increment counter.
    pub fn new(count: u64, limit: u64, reset: i64) -> Self {
        Self {
            count,
            exceeded: count > limit,
            remaining: limit.saturating_sub(count),
            reset,
        }
    }

    /// Same as [`CounterUpdate::new`], reading from a record.
    pub fn from_record(record: &CounterRecord, limit: u64) -> Self {
        Self::new(record.count, limit, record.expires_at)
    }
}
