//! Connection handle returned by a successful dial.
//!
//! A [`Connection`] owns the host socket and shares one
//! [`ConnectionShared`] block with the socket's event sink. Reads pull from
//! the shared [`ReadQueue`]; writes go straight to the socket and then wait
//! for its outbound buffer to drain.

use crate::read_queue::{NextItem, QueueItem, ReadQueue};
use crate::socket::MessageSocket;
use crate::transport::{TransportError, TransportResult, TransportStats};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Lifecycle of one dial attempt.
///
/// `Connecting → Open → Closed` on success, `Connecting → Failed` otherwise.
/// Neither `Closed` nor `Failed` is ever left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket is connecting
    Connecting,
    /// Socket is open; reads and writes are allowed
    Open,
    /// Socket closed after having been open
    Closed,
    /// Socket never opened
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result sent to the dialer once the socket opens or fails.
pub(crate) type OpenResult = TransportResult<()>;

struct Lifecycle {
    state: ConnectionState,
    opened: Option<oneshot::Sender<OpenResult>>,
    last_error: Option<String>,
}

/// State shared between a connection and its socket event sink.
pub(crate) struct ConnectionShared {
    lifecycle: Mutex<Lifecycle>,
    queue: ReadQueue,
    locally_closed: AtomicBool,
    error_reported: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl ConnectionShared {
    /// Create shared state in `Connecting`, along with the receiver that
    /// resolves when the socket opens or fails.
    pub(crate) fn new(
        read_buffer_warn_threshold: usize,
    ) -> (Arc<Self>, oneshot::Receiver<OpenResult>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                opened: Some(tx),
                last_error: None,
            }),
            queue: ReadQueue::with_warn_threshold(read_buffer_warn_threshold),
            locally_closed: AtomicBool::new(false),
            error_reported: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
        });
        (shared, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn on_open(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state != ConnectionState::Connecting {
            debug!("Ignoring open event in state {}", lifecycle.state);
            return;
        }
        lifecycle.state = ConnectionState::Open;
        if let Some(tx) = lifecycle.opened.take() {
            // Dialer may have given up already; the socket gets closed then.
            let _ = tx.send(Ok(()));
        }
        debug!("Socket open");
    }

    pub(crate) fn on_message(&self, payload: Bytes) {
        if self.locally_closed.load(Ordering::Acquire) {
            trace!("Dropping {} bytes received after local close", payload.len());
            return;
        }
        trace!("Received message of {} bytes", payload.len());
        self.bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.queue.inject_data(payload);
    }

    pub(crate) fn on_close(&self) {
        {
            let mut lifecycle = self.lock();
            match lifecycle.state {
                ConnectionState::Connecting => {
                    lifecycle.state = ConnectionState::Failed;
                    if let Some(tx) = lifecycle.opened.take() {
                        let _ = tx.send(Err(TransportError::SocketError(
                            "socket closed before opening".to_string(),
                        )));
                    }
                    debug!("Socket closed while connecting");
                }
                ConnectionState::Open => {
                    lifecycle.state = ConnectionState::Closed;
                    debug!("Socket closed");
                }
                ConnectionState::Closed | ConnectionState::Failed => {}
            }
        }
        self.queue.inject_end();
    }

    pub(crate) fn on_error(&self, message: String) {
        {
            let mut lifecycle = self.lock();
            match lifecycle.state {
                ConnectionState::Connecting => {
                    debug!("Socket error while connecting: {}", message);
                    lifecycle.state = ConnectionState::Failed;
                    if let Some(tx) = lifecycle.opened.take() {
                        let _ = tx.send(Err(TransportError::SocketError(message)));
                    }
                }
                ConnectionState::Open => {
                    warn!("Socket error on open connection: {}", message);
                    self.recv_errors.fetch_add(1, Ordering::Relaxed);
                    lifecycle.state = ConnectionState::Closed;
                    lifecycle.last_error = Some(message);
                }
                ConnectionState::Closed | ConnectionState::Failed => {
                    debug!("Ignoring socket error after close: {}", message);
                    return;
                }
            }
        }
        self.queue.inject_end();
    }

    /// Give up on a dial that never opened.
    pub(crate) fn fail_dial(&self) {
        {
            let mut lifecycle = self.lock();
            if lifecycle.state != ConnectionState::Connecting {
                return;
            }
            lifecycle.state = ConnectionState::Failed;
            lifecycle.opened = None;
        }
        self.queue.inject_end();
    }

    /// Mark the connection closed by the local side.
    ///
    /// Returns `false` if it was already closed locally.
    fn close_locally(&self) -> bool {
        if self.locally_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut lifecycle = self.lock();
        if lifecycle.state == ConnectionState::Open {
            lifecycle.state = ConnectionState::Closed;
        }
        true
    }

    fn ensure_writable(&self) -> TransportResult<()> {
        let lifecycle = self.lock();
        match lifecycle.state {
            ConnectionState::Open => Ok(()),
            _ => Err(lifecycle
                .last_error
                .clone()
                .map_or(TransportError::WriteAfterClose, TransportError::SocketError)),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The post-open socket error, the first time it is asked for.
    fn take_error_report(&self) -> Option<String> {
        let err = self.last_error()?;
        if self.error_reported.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(err)
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// How a write waits for the socket's outbound buffer to empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Delay before the first re-check of a write that didn't drain at once
    pub grace: Duration,
    /// Interval between later checks
    pub poll_interval: Duration,
}

/// An open connection to a remote WebSocket endpoint.
///
/// Dropping the connection closes the socket.
pub struct Connection<S: MessageSocket> {
    socket: S,
    shared: Arc<ConnectionShared>,
    remote_url: String,
    drain: DrainPolicy,
}

impl<S: MessageSocket> Connection<S> {
    pub(crate) fn new(
        socket: S,
        shared: Arc<ConnectionShared>,
        remote_url: String,
        drain: DrainPolicy,
    ) -> Self {
        Self {
            socket,
            shared,
            remote_url,
            drain,
        }
    }

    /// Lazy, ordered stream of inbound chunks.
    ///
    /// The stream ends once the remote side closes (after every chunk that
    /// arrived before the close) or as soon as [`close`](Self::close) is
    /// called. If the socket failed while open, the stream yields that error
    /// once before ending. Only one reader may be pulling at a time.
    #[must_use]
    pub fn reader(&self) -> ReadStream {
        ReadStream {
            shared: Arc::clone(&self.shared),
            pending: None,
            done: false,
        }
    }

    /// Read the next inbound chunk, or `None` at end of stream.
    ///
    /// # Errors
    /// Returns the post-open socket error once, or `ProtocolViolation` if
    /// another read is already outstanding.
    pub async fn read(&self) -> TransportResult<Option<Bytes>> {
        self.reader().next().await.transpose()
    }

    /// Send `data` and wait until the socket's outbound buffer has drained.
    ///
    /// The socket is not touched unless the connection is open.
    ///
    /// # Errors
    /// Returns `WriteAfterClose` if the connection closed, including while
    /// this write was draining. Returns `SocketError` if a socket error had
    /// already ended the connection or the socket rejected the message.
    pub async fn write(&self, data: &[u8]) -> TransportResult<()> {
        self.shared.ensure_writable()?;

        if let Err(e) = self.socket.send(data) {
            self.shared.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::SocketError(e.to_string()));
        }
        self.shared
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent message of {} bytes", data.len());

        self.wait_for_drain().await
    }

    async fn wait_for_drain(&self) -> TransportResult<()> {
        if self.socket.buffered_amount() == 0 {
            return Ok(());
        }

        tokio::time::sleep(self.drain.grace).await;
        loop {
            let buffered = self.socket.buffered_amount();
            if buffered == 0 {
                return Ok(());
            }
            if self.shared.state() != ConnectionState::Open {
                return Err(TransportError::WriteAfterClose);
            }
            trace!("Waiting for {} buffered bytes to drain", buffered);
            tokio::time::sleep(self.drain.poll_interval).await;
        }
    }

    /// Half-close the write side.
    ///
    /// Message sockets have no half-close, so this does nothing.
    pub fn shutdown(&self) {}

    /// Close the socket. Later reads end, later writes fail.
    pub fn close(&self) {
        if !self.shared.close_locally() {
            return;
        }
        debug!("Closing connection to {}", self.remote_url);
        self.socket.close();
        self.shared.queue.inject_end();
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether reads and writes are still allowed
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// URL the socket was opened toward
    #[must_use]
    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// Socket error that ended the connection, if any
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    /// Traffic counters for this connection
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.shared.stats()
    }
}

impl<S: MessageSocket> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: MessageSocket> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_url", &self.remote_url)
            .field("state", &self.state())
            .field("drain", &self.drain)
            .finish_non_exhaustive()
    }
}

/// Stream of inbound chunks returned by [`Connection::reader`].
#[must_use = "streams do nothing unless polled"]
pub struct ReadStream {
    shared: Arc<ConnectionShared>,
    pending: Option<NextItem>,
    done: bool,
}

impl Stream for ReadStream {
    type Item = TransportResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.shared.locally_closed.load(Ordering::Acquire) {
            this.done = true;
            this.pending = None;
            return Poll::Ready(None);
        }

        let shared = &this.shared;
        let pending = this.pending.get_or_insert_with(|| shared.queue.next());
        let result = ready!(Pin::new(pending).poll(cx));
        this.pending = None;

        match result {
            Ok(QueueItem::Data(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(QueueItem::End) => {
                this.done = true;
                Poll::Ready(
                    this.shared
                        .take_error_report()
                        .map(|e| Err(TransportError::SocketError(e))),
                )
            }
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

impl fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream")
            .field("waiting", &self.pending.is_some())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockPeer, MockSocket};
    use crate::socket::{SocketConnector, SocketEvents};

    const TEST_DRAIN: DrainPolicy = DrainPolicy {
        grace: Duration::from_millis(1),
        poll_interval: Duration::from_millis(2),
    };

    async fn open_connection() -> (Connection<MockSocket>, MockPeer) {
        let connector = MockConnector::auto_open();
        let (shared, opened) = ConnectionShared::new(ReadQueue::DEFAULT_WARN_THRESHOLD);
        let socket = connector
            .connect("ws://127.0.0.1:9000", SocketEvents::new(Arc::clone(&shared)))
            .unwrap();
        opened.await.unwrap().unwrap();
        let peer = connector.next_peer().await.unwrap();
        let conn = Connection::new(socket, shared, "ws://127.0.0.1:9000".to_string(), TEST_DRAIN);
        (conn, peer)
    }

    #[tokio::test]
    async fn test_read_in_arrival_order() {
        let (conn, peer) = open_connection().await;
        peer.deliver(&b"one"[..]);
        peer.deliver(&b"two"[..]);
        peer.close_remote();

        assert_eq!(conn.read().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(conn.read().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(conn.read().await.unwrap(), None);
        assert_eq!(conn.read().await.unwrap(), None);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reader_stream_collects_until_end() {
        let (conn, peer) = open_connection().await;
        peer.deliver(&b"a"[..]);
        peer.deliver(&b"b"[..]);
        peer.close_remote();

        let chunks: Vec<Bytes> = conn
            .reader()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn test_write_sends_and_counts() {
        let (conn, peer) = open_connection().await;
        conn.write(b"hello").await.unwrap();
        conn.write(b"world!").await.unwrap();

        assert_eq!(
            peer.sent(),
            vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world!")]
        );
        let stats = conn.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 11);
    }

    #[tokio::test]
    async fn test_write_after_close_fails_without_sending() {
        let (conn, peer) = open_connection().await;
        conn.close();

        let result = conn.write(b"late").await;
        assert!(matches!(result, Err(TransportError::WriteAfterClose)));
        assert!(peer.sent().is_empty());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_reads_immediately() {
        let (conn, peer) = open_connection().await;
        peer.deliver(&b"unread"[..]);
        conn.close();
        conn.close();

        assert_eq!(conn.read().await.unwrap(), None);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_reader() {
        let (conn, _peer) = open_connection().await;
        let mut reader = conn.reader();

        let (result, ()) = tokio::join!(reader.next(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            conn.close();
        });
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_error_after_open_surfaces_once() {
        let (conn, peer) = open_connection().await;
        peer.deliver(&b"before"[..]);
        peer.error("connection reset");

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.last_error().as_deref(), Some("connection reset"));

        assert_eq!(conn.read().await.unwrap(), Some(Bytes::from_static(b"before")));
        assert!(matches!(
            conn.read().await,
            Err(TransportError::SocketError(ref e)) if e == "connection reset"
        ));
        assert_eq!(conn.read().await.unwrap(), None);

        let result = conn.write(b"x").await;
        assert!(matches!(result, Err(TransportError::SocketError(_))));
        assert_eq!(conn.stats().recv_errors, 1);
    }

    #[tokio::test]
    async fn test_write_waits_for_drain() {
        let (conn, peer) = open_connection().await;
        peer.hold_writes(true);

        let drained = {
            let peer = peer.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert!(peer.buffered() > 0);
                peer.drain();
            }
        };

        let start = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(conn.write(b"payload"), drained);
        result.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_close_while_draining_fails_write() {
        let (conn, peer) = open_connection().await;
        peer.hold_writes(true);

        let (result, ()) = tokio::join!(conn.write(b"stuck"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            conn.close();
        });
        assert!(matches!(result, Err(TransportError::WriteAfterClose)));
    }

    #[tokio::test]
    async fn test_error_while_draining_fails_write() {
        let (conn, peer) = open_connection().await;
        peer.hold_writes(true);

        let (result, ()) = tokio::join!(conn.write(b"stuck"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.error("connection reset");
        });
        assert!(matches!(result, Err(TransportError::WriteAfterClose)));
        assert_eq!(conn.last_error().as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_send_failure_is_socket_error() {
        let (conn, peer) = open_connection().await;
        peer.fail_sends(true);

        let result = conn.write(b"x").await;
        assert!(matches!(result, Err(TransportError::SocketError(_))));
        assert_eq!(conn.stats().send_errors, 1);
    }

    #[tokio::test]
    async fn test_drop_closes_socket() {
        let (conn, peer) = open_connection().await;
        drop(conn);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_received_stats() {
        let (conn, peer) = open_connection().await;
        peer.deliver(&b"1234"[..]);
        peer.deliver(&b"56"[..]);

        let stats = conn.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.bytes_received, 6);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
