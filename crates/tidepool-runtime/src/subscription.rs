//! Standing listener registrations
//!
//! TigerStyle: Cancelled listeners are pruned, finished pipes untracked,
//! closing cancels everything.
//!
//! An actor keeps two listener lists. Subscribers each receive a copy of
//! every published notification; consumers share them, one consumer per
//! notification in round-robin order. Registrations are only modified by
//! messages running on the owning actor (or by its shutdown), so the lock
//! around them is never contended for long.

use tidepool_core::cancel::Cancel;
use tracing::debug;

use crate::message::Message;
use crate::service::ServiceRef;

/// How a listener receives notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerMode {
    /// Every notification
    Subscribe,
    /// A share of the notifications
    Consume,
}

#[derive(Debug)]
struct Listener {
    service: ServiceRef,
    cancel: Cancel,
}

impl Listener {
    fn notify<T: Clone + Send + 'static>(&self, method: &'static str, value: &T) -> Message {
        Message::send(&self.service, method, value.clone()).with_guard(self.cancel.clone())
    }
}

/// Listeners and pipe flows registered with one actor
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    subscribers: Vec<Listener>,
    consumers: Vec<Listener>,
    consumer_next: usize,
    /// Pipe flows fed by this actor
    standing: Vec<Cancel>,
    closed: bool,
}

impl Registrations {
    /// Register a listener; a closed actor cancels it immediately
    pub(crate) fn add(&mut self, mode: ListenerMode, service: ServiceRef, cancel: Cancel) {
        if self.closed {
            cancel.cancel();
            return;
        }
        if cancel.is_cancelled() {
            return;
        }

        debug!(listener = %service.address(), mode = ?mode, "Listener registered");
        let listener = Listener { service, cancel };
        match mode {
            ListenerMode::Subscribe => self.subscribers.push(listener),
            ListenerMode::Consume => self.consumers.push(listener),
        }
    }

    /// Track a pipe flow so closing the actor cancels it
    ///
    /// After close the flow is left alone: its call is rejected with
    /// `ActorClosed`, which the subscriber should see instead of a cancel.
    pub(crate) fn track(&mut self, cancel: Cancel) {
        if self.closed {
            return;
        }
        self.standing.retain(|standing| !standing.is_cancelled());
        self.standing.push(cancel);
    }

    /// Forget a pipe flow that finished
    pub(crate) fn untrack(&mut self, cancel: &Cancel) {
        self.standing.retain(|standing| !standing.same(cancel));
    }

    /// Number of tracked pipe flows
    pub(crate) fn pipe_count(&self) -> usize {
        self.standing.len()
    }

    /// Build the deliveries for one notification
    ///
    /// The caller dispatches them once the registrations lock is released.
    pub(crate) fn publish<T: Clone + Send + 'static>(
        &mut self,
        method: &'static str,
        value: &T,
    ) -> Vec<Message> {
        self.prune();

        let mut messages = Vec::with_capacity(self.subscribers.len() + 1);
        for listener in &self.subscribers {
            messages.push(listener.notify(method, value));
        }

        if !self.consumers.is_empty() {
            let index = self.consumer_next % self.consumers.len();
            self.consumer_next = index + 1;
            messages.push(self.consumers[index].notify(method, value));
        }
        messages
    }

    /// Number of live listeners of both kinds
    pub(crate) fn listener_count(&self) -> usize {
        self.subscribers
            .iter()
            .chain(self.consumers.iter())
            .filter(|listener| !listener.cancel.is_cancelled())
            .count()
    }

    fn prune(&mut self) {
        self.subscribers
            .retain(|listener| !listener.cancel.is_cancelled());
        let before = self.consumers.len();
        self.consumers
            .retain(|listener| !listener.cancel.is_cancelled());
        if self.consumers.len() != before {
            self.consumer_next = 0;
        }
    }

    /// Close and hand back every cancel handle
    ///
    /// The handles are cancelled by the caller outside the lock, since
    /// cancel hooks may run arbitrary code.
    pub(crate) fn close_all(&mut self) -> Vec<Cancel> {
        self.closed = true;
        self.consumer_next = 0;
        self.subscribers
            .drain(..)
            .chain(self.consumers.drain(..))
            .map(|listener| listener.cancel)
            .chain(self.standing.drain(..))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_prunes_and_close_returns_all() {
        let mut registrations = Registrations::default();

        let done = Cancel::new();
        registrations.track(done.clone());
        assert!(done.cancel());

        let live = Cancel::new();
        registrations.track(live.clone());

        let cancels = registrations.close_all();
        assert_eq!(cancels.len(), 1);
        assert!(!live.is_cancelled());
        for cancel in cancels {
            assert!(cancel.cancel());
        }
        assert!(live.is_cancelled());
    }

    #[test]
    fn test_untrack_removes_only_that_flow() {
        let mut registrations = Registrations::default();
        let first = Cancel::new();
        let second = Cancel::new();
        registrations.track(first.clone());
        registrations.track(second.clone());
        assert_eq!(registrations.pipe_count(), 2);

        registrations.untrack(&first);
        assert_eq!(registrations.pipe_count(), 1);
        registrations.untrack(&first);
        assert_eq!(registrations.pipe_count(), 1);

        let cancels = registrations.close_all();
        assert_eq!(cancels.len(), 1);
        assert!(cancels[0].same(&second));
    }

    #[test]
    fn test_track_after_close_is_ignored() {
        let mut registrations = Registrations::default();
        assert!(registrations.close_all().is_empty());

        let late = Cancel::new();
        registrations.track(late.clone());
        assert!(!late.is_cancelled());
        assert!(registrations.close_all().is_empty());
    }
}
