//! Outgoing message batching
//!
//! TigerStyle: Scoped acquire/release, production order preserved.
//!
//! An outbox is installed for the duration of one top-level dispatch (a
//! worker draining a batch, a direct call, an external `batch`). Messages
//! produced while it is current are appended to it and flushed when the
//! dispatch returns. The outbox also carries which inbox is currently
//! running, which is what `ServiceRef::current()` reads.
//!
//! Flushing happens only after the producing actor's cell is released, so a
//! flush never runs while this thread holds an actor.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use tidepool_core::constants::OUTBOX_INLINE_COUNT_MAX;
use tidepool_core::error::Error;
use tracing::{trace, warn};

use crate::inbox::Inbox;
use crate::message::Message;

tokio::task_local! {
    static CURRENT_OUTBOX: Rc<Outbox>;
}

/// Per-dispatch batching buffer
pub struct Outbox {
    pending: RefCell<VecDeque<Message>>,
    current: RefCell<Option<Arc<Inbox>>>,
    /// Every inbox entered and not yet left, innermost last
    running: RefCell<Vec<Arc<Inbox>>>,
    owner: Option<Arc<Inbox>>,
    inline_count: Cell<usize>,
}

impl Outbox {
    fn new(owner: Option<Arc<Inbox>>) -> Self {
        Self {
            pending: RefCell::new(VecDeque::new()),
            current: RefCell::new(owner.clone()),
            running: RefCell::new(Vec::new()),
            owner,
            inline_count: Cell::new(0),
        }
    }

    /// Run `f` with a fresh outbox installed, then flush it
    ///
    /// `owner` is the inbox whose worker is running the dispatch, if any.
    pub(crate) fn scope<R>(owner: Option<Arc<Inbox>>, f: impl FnOnce(&Outbox) -> R) -> R {
        let outbox = Rc::new(Outbox::new(owner));
        CURRENT_OUTBOX.sync_scope(outbox.clone(), || {
            let release = Release(&outbox);
            let result = f(&outbox);
            outbox.flush_all();
            drop(release);
            result
        })
    }

    /// Run `f` in the current outbox, or in a fresh scope if there is none
    pub(crate) fn run_or_join<R>(owner: Option<Arc<Inbox>>, f: impl FnOnce(&Outbox) -> R) -> R {
        match CURRENT_OUTBOX.try_with(Rc::clone) {
            Ok(outbox) => f(&outbox),
            Err(_) => Self::scope(owner, f),
        }
    }

    /// Run `f` against the current outbox, if one is installed
    pub fn with_current<R>(f: impl FnOnce(&Outbox) -> R) -> Option<R> {
        CURRENT_OUTBOX.try_with(Rc::clone).ok().map(|outbox| f(&outbox))
    }

    /// Inbox of the actor currently running on this call stack
    pub(crate) fn current_inbox() -> Option<Arc<Inbox>> {
        Self::with_current(|outbox| outbox.current.borrow().clone()).flatten()
    }

    /// Make `inbox` current until the guard drops
    pub(crate) fn enter(&self, inbox: Arc<Inbox>) -> CurrentGuard<'_> {
        self.running.borrow_mut().push(inbox.clone());
        let previous = self.current.replace(Some(inbox));
        CurrentGuard {
            outbox: self,
            previous,
        }
    }

    /// Check whether `inbox` is the one whose worker owns this outbox
    pub(crate) fn is_owned_by(&self, inbox: &Inbox) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(owner.as_ref(), inbox))
    }

    /// Check whether `inbox` is running anywhere on this call stack
    ///
    /// Covers the innermost actor and those further out in a synchronous
    /// chain, whose cells this thread still holds.
    pub(crate) fn is_running(&self, inbox: &Inbox) -> bool {
        self.running
            .borrow()
            .iter()
            .any(|running| std::ptr::eq(running.as_ref(), inbox))
    }

    /// Append an outgoing message
    pub(crate) fn push(&self, message: Message) {
        self.pending.borrow_mut().push_back(message);
    }

    /// Number of messages waiting to be flushed
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Deliver every pending message in production order
    pub fn flush(&self) {
        let batch = self.pending.take();
        for message in batch {
            deliver(message);
        }
    }

    /// Deliver all but the last pending message, then try to run the last
    /// one on this thread
    ///
    /// The last message runs inline when its target is Direct, or a queued
    /// inbox that is idle and empty. Returns `false` while messages remain
    /// (running the last one may have produced more); callers loop until
    /// `true`.
    pub fn flush_and_execute_last(&self) -> bool {
        let mut batch = self.pending.take();
        let last = batch.pop_back();
        for message in batch {
            deliver(message);
        }

        if let Some(message) = last {
            if self.inline_count.get() < OUTBOX_INLINE_COUNT_MAX {
                let inbox = message.inbox().clone();
                match inbox.try_execute_inline(message, self) {
                    Ok(()) => {
                        self.inline_count.set(self.inline_count.get() + 1);
                        trace!(address = %inbox.address(), "Executed last message inline");
                    }
                    Err(message) => deliver(message),
                }
            } else {
                deliver(message);
            }
        }

        self.pending.borrow().is_empty()
    }

    /// Flush until nothing is pending
    pub(crate) fn flush_all(&self) {
        while !self.flush_and_execute_last() {}
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("pending", &self.pending.borrow().len())
            .field(
                "current",
                &self.current.borrow().as_ref().map(|inbox| inbox.address().to_string()),
            )
            .field("inline_count", &self.inline_count.get())
            .finish()
    }
}

/// Restores the previously current inbox
pub(crate) struct CurrentGuard<'a> {
    outbox: &'a Outbox,
    previous: Option<Arc<Inbox>>,
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.outbox.running.borrow_mut().pop();
        *self.outbox.current.borrow_mut() = self.previous.take();
    }
}

/// Fails whatever is still pending when a scope unwinds
struct Release<'a>(&'a Outbox);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let leftover = self.0.pending.take();
        if leftover.is_empty() {
            return;
        }
        warn!(count = leftover.len(), "Outbox released with pending messages");
        for message in leftover {
            message.fail(Error::internal("dispatch unwound before flush"));
        }
    }
}

fn deliver(message: Message) {
    let inbox = message.inbox().clone();
    let timeout = inbox.config().offer_timeout();
    inbox.offer(message, timeout);
}

/// Hand a message to the current outbox, or straight to its inbox
///
/// Returns false only when the inbox refused the message outright.
pub(crate) fn dispatch(message: Message) -> bool {
    match CURRENT_OUTBOX.try_with(Rc::clone) {
        Ok(outbox) => {
            outbox.push(message);
            true
        }
        Err(_) => {
            let inbox = message.inbox().clone();
            let timeout = inbox.config().offer_timeout();
            inbox.offer(message, timeout)
        }
    }
}

/// Batch the messages `f` sends and flush them together on return
///
/// Outside a handler every send is offered immediately; inside `batch` the
/// sends are collected and delivered in order when `f` returns, with the
/// last one eligible to run on this thread.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Outbox::run_or_join(None, |_| f())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_outbox_outside_scope() {
        assert!(Outbox::with_current(|_| ()).is_none());
        assert!(Outbox::current_inbox().is_none());
    }

    #[test]
    fn test_scope_installs_and_nests() {
        let joined_outer = Outbox::scope(None, |outer| {
            assert_eq!(outer.pending_count(), 0);
            let inner_seen = Outbox::with_current(|current| std::ptr::eq(current, outer));
            assert_eq!(inner_seen, Some(true));

            Outbox::run_or_join(None, |joined| std::ptr::eq(joined, outer))
        });
        assert!(joined_outer);
        assert!(Outbox::with_current(|_| ()).is_none());
    }

    #[test]
    fn test_batch_outside_handler_installs_outbox() {
        let installed = batch(|| Outbox::with_current(|_| ()).is_some());
        assert!(installed);
    }
}
