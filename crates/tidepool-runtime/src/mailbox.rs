//! Actor mailbox implementation
//!
//! TigerStyle: Bounded queues with explicit limits, no silent drops.
//!
//! The mailbox is the plain FIFO behind a queued inbox. Overflow policy,
//! blocking and wakeups live in the inbox; the mailbox only refuses.

use std::collections::VecDeque;

use tidepool_core::constants::{MAILBOX_DEPTH_DEFAULT, MAILBOX_DEPTH_MAX};

use crate::message::Message;

/// Items a mailbox can hold
pub(crate) trait Queued {
    /// Runtime-internal items bypass the capacity limit
    fn is_system(&self) -> bool;

    /// Called once when the item is accepted
    fn mark_queued(&mut self);
}

impl Queued for Message {
    fn is_system(&self) -> bool {
        Message::is_system(self)
    }

    fn mark_queued(&mut self) {
        Message::mark_queued(self)
    }
}

/// Bounded mailbox for actor messages
///
/// # TigerStyle
/// - Explicit capacity limit on user messages
/// - FIFO ordering
/// - No silent drops (a refused item is handed back)
#[derive(Debug)]
pub(crate) struct Mailbox<T> {
    /// Pending items
    queue: VecDeque<T>,
    /// Maximum number of user items
    capacity: usize,
    /// User items currently queued
    user_count: usize,
}

impl<T: Queued> Mailbox<T> {
    /// Create a new mailbox with specified capacity
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "capacity must be positive");
        debug_assert!(
            capacity <= MAILBOX_DEPTH_MAX,
            "capacity exceeds MAILBOX_DEPTH_MAX"
        );

        Self {
            queue: VecDeque::with_capacity(capacity.min(MAILBOX_DEPTH_DEFAULT)),
            capacity,
            user_count: 0,
        }
    }

    /// Try to enqueue an item
    ///
    /// Hands the item back when the mailbox is full.
    pub(crate) fn push(&mut self, mut item: T) -> Result<(), T> {
        let system = item.is_system();
        if !system && self.is_full() {
            return Err(item);
        }

        item.mark_queued();
        self.queue.push_back(item);
        if !system {
            self.user_count += 1;
        }

        debug_assert!(self.user_count <= self.capacity);
        Ok(())
    }

    /// Pop the next item
    pub(crate) fn pop(&mut self) -> Option<T> {
        let item = self.queue.pop_front()?;
        if !item.is_system() {
            debug_assert!(self.user_count > 0);
            self.user_count -= 1;
        }
        Some(item)
    }

    /// Remove the oldest user item, leaving system items in place
    pub(crate) fn evict_oldest(&mut self) -> Option<T> {
        let index = self.queue.iter().position(|item| !item.is_system())?;
        let item = self.queue.remove(index)?;
        self.user_count -= 1;
        Some(item)
    }

    /// Remove every user item, leaving system items in place
    pub(crate) fn drain_user(&mut self) -> Vec<T> {
        let (system, user): (VecDeque<T>, VecDeque<T>) =
            self.queue.drain(..).partition(|item| item.is_system());
        self.queue = system;
        self.user_count = 0;
        user.into_iter().collect()
    }

    /// Check if no more user items fit
    pub(crate) fn is_full(&self) -> bool {
        self.user_count >= self.capacity
    }

    /// Check if the mailbox is empty
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get the number of pending items
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get the mailbox capacity
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
