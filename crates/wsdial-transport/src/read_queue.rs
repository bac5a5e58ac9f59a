//! Push-to-pull adapter for inbound socket messages.
//!
//! Socket callbacks push chunks and the end-of-stream marker in; a single
//! consumer pulls them out in arrival order through [`ReadQueue::next`].
//!
//! # Design
//!
//! - **Ordered**: items are delivered exactly in injection order, `End` last
//! - **Wake, don't hand off**: an injection wakes the waiting consumer, but
//!   the item stays queued until that consumer polls it out, so dropping a
//!   pending `next()` loses nothing
//! - **Single consumer**: a second concurrent `next()` is rejected with
//!   [`TransportError::ProtocolViolation`]
//! - **Unbounded**: producer-side buffering has no cap; crossing
//!   `warn_threshold` is logged

use crate::transport::{TransportError, TransportResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tracing::{error, trace, warn};

/// Item delivered by the read queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// Binary chunk from one inbound message
    Data(Bytes),
    /// No more data will ever arrive
    End,
}

impl QueueItem {
    /// Whether this is the end-of-stream marker
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

/// The one outstanding `next()`.
#[derive(Debug)]
struct Waiter {
    id: u64,
    waker: Option<Waker>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Items stay here until a consumer polls them out.
    pending: VecDeque<QueueItem>,
    waiter: Option<Waiter>,
    next_waiter_id: u64,
    ended: bool,
}

impl QueueState {
    fn is_waiter(&self, id: u64) -> bool {
        self.waiter.as_ref().is_some_and(|w| w.id == id)
    }

    fn take_waker(&mut self) -> Option<Waker> {
        self.waiter.as_mut().and_then(|w| w.waker.take())
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-producer/single-consumer ordered buffer.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use wsdial_transport::read_queue::{QueueItem, ReadQueue};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = ReadQueue::new();
/// queue.inject_data(Bytes::from_static(b"hello"));
/// queue.inject_end();
///
/// assert_eq!(queue.next().await?, QueueItem::Data(Bytes::from_static(b"hello")));
/// assert_eq!(queue.next().await?, QueueItem::End);
/// assert_eq!(queue.next().await?, QueueItem::End);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReadQueue {
    state: Arc<Mutex<QueueState>>,
    warn_threshold: usize,
}

impl Default for ReadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadQueue {
    /// Default number of buffered items before a warning is logged
    pub const DEFAULT_WARN_THRESHOLD: usize = 1024;

    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::with_warn_threshold(Self::DEFAULT_WARN_THRESHOLD)
    }

    /// Create an empty queue that warns each time `threshold` more items
    /// pile up unconsumed
    #[must_use]
    pub fn with_warn_threshold(threshold: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            warn_threshold: threshold.max(1),
        }
    }

    /// Append a chunk and wake the waiting consumer, if any.
    pub fn inject_data(&self, chunk: Bytes) {
        let waker = {
            let mut state = lock(&self.state);
            if state.ended {
                warn!("Dropping {} bytes injected after end of stream", chunk.len());
                return;
            }
            self.push(&mut state, QueueItem::Data(chunk))
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Append the end-of-stream marker. Later calls are no-ops.
    pub fn inject_end(&self) {
        let waker = {
            let mut state = lock(&self.state);
            if state.ended {
                return;
            }
            state.ended = true;
            self.push(&mut state, QueueItem::End)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Queue `item`, returning the waker to call once the lock is released.
    fn push(&self, state: &mut QueueState, item: QueueItem) -> Option<Waker> {
        state.pending.push_back(item);

        let len = state.pending.len();
        if len % self.warn_threshold == 0 {
            warn!(
                "Read queue holds {} undelivered items; reader is falling behind",
                len
            );
        }

        let waker = state.take_waker();
        if waker.is_some() {
            trace!("Waking waiting reader");
        }
        waker
    }

    /// Pull the next item.
    ///
    /// Resolves as soon as an item is buffered or the stream has ended. Only
    /// one pull may be outstanding at a time: a second one resolves with
    /// `TransportError::ProtocolViolation` and leaves the first in place.
    /// Dropping the returned future before it resolves leaves the queue
    /// untouched.
    pub fn next(&self) -> NextItem {
        let mut state = lock(&self.state);

        if state.waiter.is_some() {
            error!("Concurrent read on a single-consumer read queue");
            return NextItem {
                inner: NextInner::Rejected(Some(TransportError::ProtocolViolation(
                    "next() called while another read is outstanding".to_string(),
                ))),
            };
        }

        let id = state.next_waiter_id;
        state.next_waiter_id = id.wrapping_add(1);
        state.waiter = Some(Waiter { id, waker: None });
        NextItem {
            inner: NextInner::Waiting {
                state: Arc::clone(&self.state),
                id,
            },
        }
    }

    /// Number of buffered, undelivered items
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).pending.is_empty()
    }

    /// Whether the end-of-stream marker has been injected
    #[must_use]
    pub fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }
}

impl Drop for ReadQueue {
    fn drop(&mut self) {
        // Nothing can inject anymore; let an outstanding pull finish.
        let waker = {
            let mut state = lock(&self.state);
            state.ended = true;
            state.take_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Future returned by [`ReadQueue::next`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct NextItem {
    inner: NextInner,
}

#[derive(Debug)]
enum NextInner {
    Rejected(Option<TransportError>),
    Waiting {
        state: Arc<Mutex<QueueState>>,
        id: u64,
    },
}

impl Future for NextItem {
    type Output = TransportResult<QueueItem>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            NextInner::Rejected(err) => match err.take() {
                Some(err) => Poll::Ready(Err(err)),
                None => Poll::Ready(Ok(QueueItem::End)),
            },
            NextInner::Waiting { state, id } => {
                let mut state = lock(state);
                // Polled again after resolving
                if !state.is_waiter(*id) {
                    return Poll::Ready(Ok(QueueItem::End));
                }

                let item = match state.pending.pop_front() {
                    Some(item) => item,
                    None if state.ended => QueueItem::End,
                    None => {
                        if let Some(waiter) = state.waiter.as_mut() {
                            let stale = waiter
                                .waker
                                .as_ref()
                                .is_none_or(|w| !w.will_wake(cx.waker()));
                            if stale {
                                waiter.waker = Some(cx.waker().clone());
                            }
                        }
                        return Poll::Pending;
                    }
                };
                state.waiter = None;
                Poll::Ready(Ok(item))
            }
        }
    }
}

impl Drop for NextItem {
    fn drop(&mut self) {
        if let NextInner::Waiting { state, id } = &self.inner {
            let mut state = lock(state);
            if state.is_waiter(*id) {
                state.waiter = None;
            }
        }
    }
}
