//! Per-attempt connection deadline

use crate::error::{Result, TetherError};
use std::time::{Duration, Instant};

/// Optional point in time by which a connection must be established
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    /// Deadline `limit` from now, or none
    pub fn after(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// No deadline
    pub fn none() -> Self {
        Self::after(None)
    }

    /// Time left, `None` when unbounded. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    /// True once the deadline has passed
    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Time left, or a `Timeout` error for `host` if none remains.
    pub fn check(&self, host: &str) -> Result<Option<Duration>> {
        match self.remaining() {
            Some(left) if left.is_zero() => Err(self.timeout_error(host)),
            other => Ok(other),
        }
    }

    /// The error to raise when this deadline expires
    pub fn timeout_error(&self, host: &str) -> TetherError {
        TetherError::Timeout {
            host: host.to_string(),
            after: self.limit.unwrap_or_default(),
        }
    }

    /// Map an I/O timeout from a blocking call onto the deadline error
    pub fn map_io(&self, host: &str, err: std::io::Error) -> TetherError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                if self.limit.is_some() =>
            {
                self.timeout_error(host)
            }
            _ => TetherError::connection(host, err.to_string()),
        }
    }
}
