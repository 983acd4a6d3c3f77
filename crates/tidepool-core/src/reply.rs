//! Completion callbacks
//!
//! TigerStyle: Exactly one completion per reply, enforced by ownership.
//!
//! A [`Reply`] is handed to whoever will produce a value. Completing it
//! (`handle`, `ok`, `fail`) consumes it, so a second completion does not
//! compile. Dropping it without completing delivers
//! [`Error::ReplyDropped`], so the waiting side always observes exactly one
//! outcome.
//!
//! ```rust,ignore
//! let (reply, rx) = Reply::<usize>::channel();
//! let len_reply: Reply<String> = reply.of(|s: String| s.len());
//! len_reply.ok("hello".into());
//! assert_eq!(rx.blocking_recv()?, 5);
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Exactly-once result callback
#[must_use = "a reply that is dropped completes with Error::ReplyDropped"]
pub struct Reply<T> {
    callback: Option<Callback<T>>,
}

impl<T: Send + 'static> Reply<T> {
    /// Create a reply from a completion function
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    /// A reply whose outcome nobody observes
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    /// A reply bridged to a future
    pub fn channel() -> (Self, ReplyReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        let reply = Self::new(move |result| {
            // Receiver may have given up waiting
            let _ = tx.send(result);
        });
        (reply, ReplyReceiver { rx })
    }

    /// Complete with a result
    pub fn handle(mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Complete with a value
    pub fn ok(self, value: T) {
        self.handle(Ok(value));
    }

    /// Complete with an error
    pub fn fail(self, error: Error) {
        self.handle(Err(error));
    }

    /// Derive a reply whose value is mapped through `f` before forwarding
    ///
    /// Errors pass through unchanged. The derived reply inherits the
    /// exactly-once guarantee: completing or dropping it completes `self`.
    pub fn of<S, F>(self, f: F) -> Reply<S>
    where
        S: Send + 'static,
        F: FnOnce(S) -> T + Send + 'static,
    {
        Reply::new(move |result: Result<S>| self.handle(result.map(f)))
    }

    /// Derive a reply whose value is mapped through a fallible `f`
    pub fn of_result<S, F>(self, f: F) -> Reply<S>
    where
        S: Send + 'static,
        F: FnOnce(S) -> Result<T> + Send + 'static,
    {
        Reply::new(move |result: Result<S>| self.handle(result.and_then(f)))
    }
}

impl<T: Send + 'static> Reply<Vec<T>> {
    /// Split into `count` branch replies joined back into one `Vec`
    ///
    /// Branch results keep their branch order. The first failing branch
    /// completes the joined reply; later branch outcomes are discarded.
    /// With `count == 0` the joined reply completes immediately with an
    /// empty vector.
    pub fn fork(self, count: usize) -> Vec<Reply<T>> {
        if count == 0 {
            self.ok(Vec::new());
            return Vec::new();
        }

        let join = Arc::new(Mutex::new(Join {
            slots: (0..count).map(|_| None).collect(),
            remaining: count,
            reply: Some(self),
        }));

        (0..count)
            .map(|index| {
                let join = join.clone();
                Reply::new(move |result| Join::complete(&join, index, result))
            })
            .collect()
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(Error::ReplyDropped));
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Fork/join
// =============================================================================

struct Join<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
    reply: Option<Reply<Vec<T>>>,
}

impl<T: Send + 'static> Join<T> {
    fn complete(join: &Mutex<Join<T>>, index: usize, result: Result<T>) {
        // Completion runs user code, so it happens after the lock is released
        let finished = {
            let mut state = join.lock();
            if state.reply.is_none() {
                return;
            }
            match result {
                Err(e) => state.reply.take().map(|reply| (reply, Err(e))),
                Ok(value) => {
                    debug_assert!(state.slots[index].is_none(), "branch completed twice");
                    state.slots[index] = Some(value);
                    state.remaining -= 1;
                    if state.remaining == 0 {
                        let values = state.slots.drain(..).flatten().collect::<Vec<_>>();
                        state.reply.take().map(|reply| (reply, Ok(values)))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((reply, result)) = finished {
            reply.handle(result);
        }
    }
}

// =============================================================================
// Async bridge
// =============================================================================

/// Receiving side of [`Reply::channel`]
#[must_use = "the reply value is lost unless the receiver is awaited"]
pub struct ReplyReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ReplyReceiver<T> {
    /// Block the current thread until the reply completes
    ///
    /// Must not be called from inside an async context.
    pub fn blocking_recv(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ReplyDropped),
        }
    }

    /// Take the result if the reply already completed
    pub fn try_recv(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::ReplyDropped)),
        }
    }
}

impl<T> Future for ReplyReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::ReplyDropped),
        })
    }
}

impl<T> fmt::Debug for ReplyReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyReceiver").finish_non_exhaustive()
    }
}
