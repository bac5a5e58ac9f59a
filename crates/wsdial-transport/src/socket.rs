//! Host socket seam.
//!
//! The host environment owns the actual message socket. It plugs in through
//! two traits: [`SocketConnector`] opens a socket toward a URL, and the
//! returned [`MessageSocket`] sends messages and reports how much outbound
//! data is still queued. Inbound events flow back through the
//! [`SocketEvents`] sink the dialer hands to `connect`.

use crate::connection::ConnectionShared;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::Arc;

/// An open (or opening) message-oriented socket.
pub trait MessageSocket: Send + Sync + 'static {
    /// Queue one binary message for sending.
    ///
    /// # Errors
    /// Returns an error if the host socket rejects the message.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Bytes accepted by `send` that have not yet been flushed to the network.
    fn buffered_amount(&self) -> usize;

    /// Terminate the socket. Must be safe to call more than once.
    fn close(&self);
}

/// Opens message sockets on behalf of the dialer.
pub trait SocketConnector: Send + Sync + 'static {
    /// Socket type produced by this connector
    type Socket: MessageSocket;

    /// Start connecting to `url`.
    ///
    /// The connector reports every later event for this socket through
    /// `events`, and may do so from any thread, including before `connect`
    /// returns.
    ///
    /// # Errors
    /// Returns an error if the connection attempt can't even be started.
    fn connect(&self, url: &str, events: SocketEvents) -> io::Result<Self::Socket>;
}

/// Event sink for one socket.
///
/// Each method corresponds to one of the host socket's callbacks. Cloning
/// yields another handle onto the same connection.
#[derive(Clone)]
pub struct SocketEvents {
    shared: Arc<ConnectionShared>,
}

impl SocketEvents {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// The socket finished connecting.
    pub fn open(&self) {
        self.shared.on_open();
    }

    /// One inbound message arrived.
    pub fn message(&self, payload: impl Into<Bytes>) {
        self.shared.on_message(payload.into());
    }

    /// The socket closed, locally or remotely.
    pub fn close(&self) {
        self.shared.on_close();
    }

    /// The socket reported an error.
    pub fn error(&self, err: impl fmt::Display) {
        self.shared.on_error(err.to_string());
    }
}

impl fmt::Debug for SocketEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEvents")
            .field("state", &self.shared.state())
            .finish()
    }
}
