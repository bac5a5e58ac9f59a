//! Transport trait abstraction for dial-only transports.
//!
//! This module defines the `Transport` trait the networking stack talks to,
//! together with the shared error type and per-connection statistics.

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Multiaddr is malformed or names a protocol stack this transport can't dial
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Operation is not available in this environment
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// Underlying socket reported an error
    #[error("Socket error: {0}")]
    SocketError(String),

    /// Write attempted while the connection is not open
    #[error("Write attempted on a connection that is not open")]
    WriteAfterClose,

    /// Caller broke the single-consumer read contract
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Socket did not open within the configured dial timeout
    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error from the host socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport trait used by the networking stack.
///
/// Only the outbound half is meaningful here: `listen_on` exists so the
/// transport fits the same registry as listening transports, and always
/// fails with [`TransportError::NotSupported`].
///
/// # Examples
///
/// ```no_run
/// use wsdial_transport::Transport;
/// use wsdial_transport::testing::MockConnector;
/// use wsdial_transport::websocket::WebSocketTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = WebSocketTransport::new(MockConnector::auto_open());
/// let conn = transport.dial("/ip4/127.0.0.1/tcp/9000/ws").await?;
/// conn.write(b"hello").await?;
/// conn.close();
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection handle produced by a successful dial
    type Output: Send;

    /// Listener handle produced by `listen_on`
    type Listener: Send;

    /// Dial a remote multiaddr.
    ///
    /// # Errors
    /// Returns `UnsupportedAddress` for addresses this transport can't handle,
    /// or `SocketError` / `DialTimeout` if the socket never opens.
    async fn dial(&self, addr: &str) -> TransportResult<Self::Output>;

    /// Start listening on a multiaddr.
    ///
    /// # Errors
    /// Returns `NotSupported` on transports without a listener role.
    fn listen_on(&self, addr: &str) -> TransportResult<Self::Listener>;

    /// Check whether `addr` is something this transport could dial.
    fn can_dial(&self, addr: &str) -> bool;
}

/// Per-connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Socket errors reported after the connection opened
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
