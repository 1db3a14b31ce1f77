//! Results of operations that may be applied later.
//!
//! A [`Ticket`] is handed back by every table operation. It is either ready at
//! once (the partition lock was free) or pending until some later lock holder
//! drains the deferred queue. A pending ticket moves through
//! `Pending -> Applied | Cancelled`; cancelling suppresses delivery of the
//! result but never un-queues the operation itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

const PENDING: u8 = 0;
const APPLIED: u8 = 1;
const CANCELLED: u8 = 2;

/// Lifecycle of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// The operation is queued behind a busy partition.
    Pending,
    /// The operation ran and its result was (or will be) delivered.
    Applied,
    /// The holder gave up; the result will be discarded.
    Cancelled,
}

/// The ticket was cancelled, or its operation was discarded with the table.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation result is no longer available")]
pub struct Cancelled;

enum Inner<T> {
    Ready(Option<T>),
    Waiting {
        rx: oneshot::Receiver<T>,
        state: Arc<AtomicU8>,
    },
}

/// Handle on the result of a possibly deferred operation.
pub struct Ticket<T> {
    inner: Inner<T>,
}

// The result is moved out by value and never pinned in place.
impl<T> Unpin for Ticket<T> {}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("state", &self.state()).finish()
    }
}

impl<T> Ticket<T> {
    /// A ticket whose operation already ran.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(Some(value)),
        }
    }

    /// A pending ticket and the completer that resolves it.
    pub fn pending() -> (Self, Completer<T>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(PENDING));
        let ticket = Self {
            inner: Inner::Waiting {
                rx,
                state: Arc::clone(&state),
            },
        };
        (ticket, Completer { tx, state })
    }

    /// Where the operation currently stands.
    pub fn state(&self) -> TicketState {
        match &self.inner {
            Inner::Ready(_) => TicketState::Applied,
            Inner::Waiting { state, .. } => match state.load(Ordering::Acquire) {
                PENDING => TicketState::Pending,
                APPLIED => TicketState::Applied,
                _ => TicketState::Cancelled,
            },
        }
    }

    /// Whether the operation had to be queued.
    pub fn is_deferred(&self) -> bool {
        matches!(self.inner, Inner::Waiting { .. })
    }

    /// Stop waiting for the result.
    ///
    /// Returns `true` if the ticket was still pending; the queued operation
    /// still executes but its result is dropped.
    pub fn cancel(&mut self) -> bool {
        match &mut self.inner {
            Inner::Ready(_) => false,
            Inner::Waiting { rx, state } => {
                let won = state
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if won {
                    rx.close();
                }
                won
            }
        }
    }

    /// Take the result if it is available, without waiting.
    pub fn try_take(&mut self) -> Option<T> {
        match &mut self.inner {
            Inner::Ready(value) => value.take(),
            Inner::Waiting { rx, .. } => rx.try_recv().ok(),
        }
    }
}

impl<T> Future for Ticket<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(value) => Poll::Ready(value.take().ok_or(Cancelled)),
            Inner::Waiting { rx, state } => {
                if state.load(Ordering::Acquire) == CANCELLED {
                    return Poll::Ready(Err(Cancelled));
                }
                Pin::new(rx).poll(cx).map(|res| res.map_err(|_| Cancelled))
            }
        }
    }
}

/// Resolves a pending [`Ticket`].
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
    state: Arc<AtomicU8>,
}

impl<T> Completer<T> {
    /// Deliver the result unless the ticket was cancelled first.
    ///
    /// Returns `true` if the result was handed over.
    pub fn complete(self, value: T) -> bool {
        self.offer(value).is_ok()
    }

    /// Deliver the result, or give it back when nobody can receive it: the
    /// ticket was cancelled or has been dropped.
    pub fn offer(self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(PENDING, APPLIED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }
        self.tx.send(value).map_err(|value| {
            self.state.store(CANCELLED, Ordering::Release);
            value
        })
    }
}
