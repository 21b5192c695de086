//! Data-link status and the shared reconnect backoff.
//!
//! `ConnectionState` is written only by the data-link supervisor and read by
//! the display layer. `RetryDelay` is the backoff both supervisors use: it
//! starts at a floor, grows by a fixed step per failed attempt, holds at the
//! ceiling, and drops back to the floor on any successful connect.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{read, write};

pub const RETRY_FLOOR: Duration = Duration::from_secs(1);
pub const RETRY_STEP: Duration = Duration::from_secs(1);
pub const RETRY_CEILING: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// RetryDelay
// ---------------------------------------------------------------------------

/// Additive (linear) backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct RetryDelay {
    floor: Duration,
    step: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::new(RETRY_FLOOR, RETRY_STEP, RETRY_CEILING)
    }
}

impl RetryDelay {
    pub fn new(floor: Duration, step: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        RetryDelay {
            floor,
            step,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt, without growing it.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait after a failed attempt. Grows the following one.
    pub fn after_failure(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current + self.step).min(self.ceiling);
        wait
    }

    /// Back to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Point-in-time view of the data link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_error: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
}

#[derive(Debug, Default)]
struct ConnectionInner {
    connected: bool,
    last_error: Option<DateTime<Utc>>,
    failed_attempts: u32,
}

/// Primary data-link status shared with the display layer.
#[derive(Debug, Default)]
pub struct ConnectionState {
    inner: RwLock<ConnectionInner>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link is up: clears the failure counter and timestamp.
    pub fn set_connected(&self) {
        let mut inner = write(&self.inner);
        inner.connected = true;
        inner.failed_attempts = 0;
        inner.last_error = None;
    }

    /// Link is down. Returns whether it was up before this call.
    pub fn set_disconnected(&self) -> bool {
        let mut inner = write(&self.inner);
        std::mem::replace(&mut inner.connected, false)
    }

    /// Count a failed attempt (open failure, read error, stream end).
    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&self, at: DateTime<Utc>) {
        let mut inner = write(&self.inner);
        inner.failed_attempts += 1;
        inner.last_error = Some(at);
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = read(&self.inner);
        ConnectionStatus {
            connected: inner.connected,
            last_error: inner.last_error,
            failed_attempts: inner.failed_attempts,
        }
    }

    pub fn is_connected(&self) -> bool {
        read(&self.inner).connected
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
