//! In-memory socket for tests and host-less demos.
//!
//! [`MockConnector`] stands in for the host's socket factory. Every
//! `connect` produces a [`MockSocket`] (handed to the dialer) and a
//! [`MockPeer`] (handed to the test) that drives the socket's events and
//! inspects what was sent.
//!
//! # Example
//!
//! ```
//! use wsdial_transport::Transport;
//! use wsdial_transport::testing::MockConnector;
//! use wsdial_transport::websocket::WebSocketTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = MockConnector::auto_open();
//! let transport = WebSocketTransport::new(connector.clone());
//!
//! let conn = transport.dial("/ip4/127.0.0.1/tcp/9000/ws").await?;
//! let peer = connector.next_peer().await.expect("peer");
//!
//! peer.deliver(&b"ping"[..]);
//! assert_eq!(conn.read().await?.as_deref(), Some(&b"ping"[..]));
//! # Ok(())
//! # }
//! ```

use crate::socket::{MessageSocket, SocketConnector, SocketEvents};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// How a [`MockConnector`] treats new connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Fire the open event from inside `connect`
    AutoOpen,
    /// Leave the socket connecting; the test drives it through [`MockPeer`]
    Manual,
    /// Fail `connect` outright
    Refuse,
}

struct ConnectorInner {
    mode: ConnectMode,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
    dialed: Mutex<Vec<String>>,
}

/// Socket factory backed by memory.
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl MockConnector {
    /// Create a connector with the given mode
    #[must_use]
    pub fn new(mode: ConnectMode) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                mode,
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
                dialed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connector whose sockets open immediately
    #[must_use]
    pub fn auto_open() -> Self {
        Self::new(ConnectMode::AutoOpen)
    }

    /// Connector whose sockets wait for [`MockPeer::open`]
    #[must_use]
    pub fn manual() -> Self {
        Self::new(ConnectMode::Manual)
    }

    /// Connector that refuses every connection attempt
    #[must_use]
    pub fn refusing() -> Self {
        Self::new(ConnectMode::Refuse)
    }

    /// Wait for the peer side of the next socket this connector creates.
    pub async fn next_peer(&self) -> Option<MockPeer> {
        self.inner.peers_rx.lock().await.recv().await
    }

    /// URLs passed to `connect`, in call order
    #[must_use]
    pub fn dialed_urls(&self) -> Vec<String> {
        lock(&self.inner.dialed).clone()
    }
}

impl SocketConnector for MockConnector {
    type Socket = MockSocket;

    fn connect(&self, url: &str, events: SocketEvents) -> io::Result<MockSocket> {
        lock(&self.inner.dialed).push(url.to_string());

        if self.inner.mode == ConnectMode::Refuse {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection to {url} refused"),
            ));
        }

        let state = Arc::new(PeerState {
            url: url.to_string(),
            events,
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            hold_writes: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });

        if self.inner.mode == ConnectMode::AutoOpen {
            state.events.open();
        }
        // Receiver lives as long as the connector
        let _ = self.inner.peers_tx.send(MockPeer {
            state: Arc::clone(&state),
        });

        Ok(MockSocket { state })
    }
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector")
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

struct PeerState {
    url: String,
    events: SocketEvents,
    sent: Mutex<Vec<Bytes>>,
    buffered: AtomicUsize,
    closed: AtomicBool,
    hold_writes: AtomicBool,
    fail_sends: AtomicBool,
}

/// Dialer-side half of an in-memory socket.
pub struct MockSocket {
    state: Arc<PeerState>,
}

impl MessageSocket for MockSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        if self.state.fail_sends.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send rejected"));
        }
        lock(&self.state.sent).push(Bytes::copy_from_slice(data));
        if self.state.hold_writes.load(Ordering::Acquire) {
            self.state.buffered.fetch_add(data.len(), Ordering::AcqRel);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.state.events.close();
        }
    }
}

impl fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSocket")
            .field("url", &self.state.url)
            .finish_non_exhaustive()
    }
}

/// Test-side half of an in-memory socket.
#[derive(Clone)]
pub struct MockPeer {
    state: Arc<PeerState>,
}

impl MockPeer {
    /// URL the socket was opened toward
    #[must_use]
    pub fn url(&self) -> &str {
        &self.state.url
    }

    /// Fire the open event
    pub fn open(&self) {
        self.state.events.open();
    }

    /// Deliver one inbound message
    pub fn deliver(&self, payload: impl Into<Bytes>) {
        self.state.events.message(payload);
    }

    /// Close from the remote side
    pub fn close_remote(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.state.events.close();
        }
    }

    /// Fire the error event
    pub fn error(&self, message: &str) {
        self.state.events.error(message);
    }

    /// Messages the dialer has sent, in order
    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.state.sent).clone()
    }

    /// Keep sent bytes counted as buffered until [`drain`](Self::drain)
    pub fn hold_writes(&self, hold: bool) {
        self.state.hold_writes.store(hold, Ordering::Release);
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::Release);
    }

    /// Bytes currently reported as buffered
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.buffered.load(Ordering::Acquire)
    }

    /// Flush everything buffered
    pub fn drain(&self) {
        self.state.buffered.store(0, Ordering::Release);
    }

    /// Whether the socket has been closed by either side
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeer")
            .field("url", &self.state.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
