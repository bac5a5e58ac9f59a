//! # wsdial Transport
//!
//! Dial-only WebSocket transport for hosts that expose an event-driven
//! message socket (connect, send, on-message, on-close, on-error) instead of
//! a byte stream.
//!
//! This crate provides:
//! - Multiaddr to WebSocket URL translation
//! - An ordered, single-consumer read queue bridging socket events to pulls
//! - Connections with drain-aware writes and explicit close
//! - An in-memory socket for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod connection;
pub mod read_queue;
pub mod socket;
pub mod testing;
pub mod transport;
pub mod websocket;

pub use address::{ConnectionTarget, Scheme};
pub use connection::{Connection, ConnectionState, ReadStream};
pub use read_queue::{QueueItem, ReadQueue};
pub use socket::{MessageSocket, SocketConnector, SocketEvents};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use websocket::WebSocketTransport;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between buffered-amount checks while a write drains (ms)
    pub drain_poll_interval_ms: u64,
    /// Delay before the first re-check of a write that didn't drain at once (ms)
    pub drain_grace_ms: u64,
    /// Give up on dials that haven't opened after this long (ms); unset waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_timeout_ms: Option<u64>,
    /// Unread inbound messages per connection before a warning is logged
    pub read_buffer_warn_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval_ms: 5,
            drain_grace_ms: 1,
            dial_timeout_ms: None,
            read_buffer_warn_threshold: ReadQueue::DEFAULT_WARN_THRESHOLD,
        }
    }
}

impl TransportConfig {
    /// Set the drain polling interval
    #[must_use]
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval_ms = duration_ms(interval);
        self
    }

    /// Set the grace delay before the first drain re-check
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace_ms = duration_ms(grace);
        self
    }

    /// Set a dial timeout
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Set the unread-message warning threshold
    #[must_use]
    pub fn with_read_buffer_warn_threshold(mut self, threshold: usize) -> Self {
        self.read_buffer_warn_threshold = threshold;
        self
    }

    /// Drain polling interval
    #[must_use]
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    /// Grace delay before the first drain re-check
    #[must_use]
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Dial timeout, if any
    #[must_use]
    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration for values that would stall or spin.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> TransportResult<()> {
        if self.drain_poll_interval_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "drain_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.dial_timeout_ms == Some(0) {
            return Err(TransportError::InvalidConfig(
                "dial_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        if self.read_buffer_warn_threshold == 0 {
            return Err(TransportError::InvalidConfig(
                "read_buffer_warn_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
