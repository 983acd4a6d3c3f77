//! Inboxes and delivery strategies
//!
//! TigerStyle: One interface, explicit strategies, bounded queues.
//!
//! Every actor has exactly one inbox. All strategies share the same
//! contract (`offer`, `is_closed`, `shutdown`) and differ only in where the
//! message runs:
//!
//! - Direct: on the offering thread, under the actor's lock
//! - Queue: appended to a bounded mailbox drained by at most one worker
//! - Spawn: on the executor, against an instance from a pool
//! - Pinned: wrapped and handed to a parent inbox
//!
//! For Direct and Queue the actor cell is behind a mutex that is held for
//! exactly one invocation, so at most one message runs per actor.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tidepool_core::config::{
    ContainerConfig, DeliveryStrategy, InboxConfig, OverflowPolicy, PipeConfig,
};
use tidepool_core::error::Error;
use tidepool_core::executor::Executor;
use tidepool_core::io::TimeProvider;
use tidepool_core::metrics;
use tracing::{debug, error, trace, warn};

use crate::journal::Journal;
use crate::lifecycle::{ActorCell, LifecycleState, ShutdownMode};
use crate::mailbox::Mailbox;
use crate::message::{Lifecycle, Message, MessageKind};
use crate::method::{panic_message, MethodDirectory};
use crate::outbox::Outbox;
use crate::service::ServiceRef;
use crate::services::{Services, ServicesInner};
use crate::subscription::Registrations;

/// Counters for one inbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxStats {
    /// Messages accepted
    pub offered: u64,
    /// Messages refused, evicted, or expired
    pub rejected: u64,
    /// Handler invocations finished
    pub processed: u64,
    /// Messages waiting in the queue
    pub pending: usize,
}

/// Builds fresh actor cells for a Spawn inbox
pub(crate) type CellFactory = Box<dyn Fn() -> ActorCell + Send + Sync + 'static>;

/// Execution placement chosen when the inbox is built
pub(crate) enum DeliveryKind {
    Direct(ActorCell),
    Queue(ActorCell),
    Spawn(CellFactory),
    Pinned { parent: Arc<Inbox>, cell: ActorCell },
}

/// Everything an inbox needs besides its delivery
pub(crate) struct InboxParts {
    pub(crate) address: String,
    pub(crate) config: InboxConfig,
    pub(crate) directory: Arc<MethodDirectory>,
    pub(crate) manager: Weak<ServicesInner>,
    pub(crate) parent: Option<Weak<Inbox>>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) container: ContainerConfig,
    pub(crate) pipe: PipeConfig,
}

/// One actor's inbox
pub(crate) struct Inbox {
    address: String,
    strategy: DeliveryStrategy,
    config: InboxConfig,
    directory: Arc<MethodDirectory>,
    manager: Weak<ServicesInner>,
    parent: Option<Weak<Inbox>>,
    journal: Arc<dyn Journal>,
    time: Arc<dyn TimeProvider>,
    executor: Arc<dyn Executor>,
    container_config: ContainerConfig,
    pipe_config: PipeConfig,
    state: AtomicU8,
    closed: AtomicBool,
    started: AtomicBool,
    pin_count: AtomicU64,
    offered: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    registrations: Mutex<Registrations>,
    delivery: Delivery,
}

enum Delivery {
    Direct(DirectDelivery),
    Queue(Arc<QueueDelivery>),
    Spawn(Arc<SpawnDelivery>),
    Pinned(PinnedDelivery),
}

impl Inbox {
    pub(crate) fn new(parts: InboxParts, kind: DeliveryKind) -> Arc<Self> {
        debug_assert!(!parts.address.is_empty(), "address must not be empty");

        let strategy = match &kind {
            DeliveryKind::Direct(_) => DeliveryStrategy::Direct,
            DeliveryKind::Queue(_) => DeliveryStrategy::Queue,
            DeliveryKind::Spawn(_) => DeliveryStrategy::Spawn,
            DeliveryKind::Pinned { parent, .. } => parent.strategy(),
        };
        let delivery = match kind {
            DeliveryKind::Direct(cell) => Delivery::Direct(DirectDelivery {
                cell: Mutex::new(cell),
            }),
            DeliveryKind::Queue(cell) => Delivery::Queue(Arc::new(QueueDelivery {
                cell: Mutex::new(cell),
                mailbox: Mutex::new(Mailbox::with_capacity(parts.config.capacity)),
                space: Condvar::new(),
                worker: AtomicU8::new(WORKER_IDLE),
            })),
            DeliveryKind::Spawn(factory) => Delivery::Spawn(Arc::new(SpawnDelivery {
                factory,
                pool: Mutex::new(Vec::new()),
                running: Mutex::new(0),
                space: Condvar::new(),
                concurrency_max: parts.config.spawn_concurrency_max,
            })),
            DeliveryKind::Pinned { parent, cell } => Delivery::Pinned(PinnedDelivery {
                parent,
                cell: Arc::new(Mutex::new(cell)),
            }),
        };

        Arc::new(Self {
            address: parts.address,
            strategy,
            config: parts.config,
            directory: parts.directory,
            manager: parts.manager,
            parent: parts.parent,
            journal: parts.journal,
            time: parts.time,
            executor: parts.executor,
            container_config: parts.container,
            pipe_config: parts.pipe,
            state: AtomicU8::new(LifecycleState::New.as_u8()),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pin_count: AtomicU64::new(0),
            offered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            registrations: Mutex::new(Registrations::default()),
            delivery,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn strategy(&self) -> DeliveryStrategy {
        self.strategy
    }

    pub(crate) fn is_pinned(&self) -> bool {
        matches!(self.delivery, Delivery::Pinned(_))
    }

    pub(crate) fn config(&self) -> &InboxConfig {
        &self.config
    }

    pub(crate) fn directory(&self) -> &Arc<MethodDirectory> {
        &self.directory
    }

    pub(crate) fn manager(&self) -> Option<Services> {
        self.manager.upgrade().map(Services::from_inner)
    }

    pub(crate) fn manager_weak(&self) -> Weak<ServicesInner> {
        self.manager.clone()
    }

    pub(crate) fn parent(&self) -> Option<ServiceRef> {
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(ServiceRef::from_inbox)
    }

    pub(crate) fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub(crate) fn time(&self) -> &Arc<dyn TimeProvider> {
        &self.time
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub(crate) fn container_config(&self) -> &ContainerConfig {
        &self.container_config
    }

    pub(crate) fn pipe_config(&self) -> &PipeConfig {
        &self.pipe_config
    }

    pub(crate) fn registrations(&self) -> &Mutex<Registrations> {
        &self.registrations
    }

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the started flag; true only for the first caller
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn next_pin_id(&self) -> u64 {
        self.pin_count.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> InboxStats {
        InboxStats {
            offered: self.offered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    fn pending_count(&self) -> usize {
        match &self.delivery {
            Delivery::Queue(queue) => queue.mailbox.lock().len(),
            Delivery::Direct(_) | Delivery::Spawn(_) | Delivery::Pinned(_) => 0,
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    /// Publish a cell's lifecycle state
    ///
    /// A Spawn inbox has many cells; only states that hold for the whole
    /// inbox are published.
    pub(crate) fn observe_state(&self, state: LifecycleState) {
        if self.strategy == DeliveryStrategy::Spawn
            && !self.is_pinned()
            && !matches!(
                state,
                LifecycleState::Active | LifecycleState::Closing | LifecycleState::Closed
            )
        {
            return;
        }
        if self.is_closed() && !state.is_closed() {
            return;
        }
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn record_offered(&self) {
        self.offered.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_offered(&self.strategy.to_string());
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self, error: &Error) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_rejected(error.kind());
    }

    /// Fail a message this inbox refused
    fn reject(&self, message: Message, error: Error) -> bool {
        warn!(
            address = %self.address,
            method = %message.method_name(),
            error = %error,
            "Message rejected"
        );
        self.record_rejected(&error);
        message.fail(error);
        false
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Offer a message; returns whether it was accepted
    ///
    /// `timeout` bounds how long a `Block` overflow policy waits for space;
    /// `Duration::MAX` waits until space frees up or the inbox closes. A
    /// refused message has its completion target failed before this returns.
    pub(crate) fn offer(self: &Arc<Self>, message: Message, timeout: Duration) -> bool {
        debug_assert!(
            std::ptr::eq(message.inbox().as_ref(), self.as_ref()),
            "message offered to the wrong inbox"
        );

        if self.is_closed() && !message.is_system() {
            return self.reject(message, Error::actor_closed(&self.address));
        }

        let accepted = match &self.delivery {
            Delivery::Direct(direct) => direct.offer(self, message),
            Delivery::Queue(queue) => queue.offer(self, message, timeout),
            Delivery::Spawn(spawn) => spawn.offer(self, message, timeout),
            Delivery::Pinned(pinned) => pinned.offer(self, message, timeout),
        };
        if accepted {
            self.record_offered();
        }
        accepted
    }

    /// Run `message` on this thread if the inbox allows it right now
    ///
    /// Direct inboxes always allow it. Queue inboxes allow it when no worker
    /// is scheduled and the mailbox is empty, so FIFO order is kept.
    pub(crate) fn try_execute_inline(
        self: &Arc<Self>,
        message: Message,
        outbox: &Outbox,
    ) -> Result<(), Message> {
        if self.is_closed() && !message.is_system() {
            return Err(message);
        }
        let result = match &self.delivery {
            Delivery::Direct(direct) => {
                direct.invoke(self, message, outbox);
                Ok(())
            }
            Delivery::Queue(queue) => queue.try_execute_inline(self, message, outbox),
            Delivery::Spawn(_) | Delivery::Pinned(_) => Err(message),
        };
        if result.is_ok() {
            self.record_offered();
        }
        result
    }

    /// Run `message` on the caller's thread if the actor is free right now
    ///
    /// Only FIFO order relative to queued traffic is skipped; the actor lock
    /// is still taken, without waiting, and `after_batch` runs as for any
    /// one-message batch. Inside a handler the call joins the caller's
    /// outbox, so its sends flush once the caller's actor is released.
    pub(crate) fn try_invoke_direct(self: &Arc<Self>, message: Message) -> Result<(), Message> {
        if self.is_closed() || !self.lifecycle().is_active() {
            return Err(message);
        }
        let cell = match &self.delivery {
            Delivery::Direct(direct) => &direct.cell,
            Delivery::Queue(queue) => &queue.cell,
            Delivery::Spawn(_) | Delivery::Pinned(_) => return Err(message),
        };
        let Some(guard) = cell.try_lock() else {
            return Err(message);
        };
        if !guard.state().is_active() {
            return Err(message);
        }

        self.record_offered();
        trace!(address = %self.address, method = %message.method_name(), "Direct call");
        Outbox::run_or_join(None, move |outbox| {
            let mut guard = guard;
            invoke_caught(self, message, &mut guard, outbox);
            guard.after_batch(self, outbox);
        });
        Ok(())
    }

    /// Close the inbox
    ///
    /// Further ordinary offers are refused, blocked offers wake and fail,
    /// standing registrations are cancelled, and the actor's shutdown hook
    /// runs after (Graceful) or instead of (Immediate) queued messages.
    pub(crate) fn shutdown(self: &Arc<Self>, mode: ShutdownMode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(address = %self.address, mode = %mode, "Inbox closing");

        let cancels = self.registrations.lock().close_all();
        for cancel in cancels {
            cancel.cancel();
        }

        match &self.delivery {
            Delivery::Direct(direct) => direct.close(self, mode),
            Delivery::Queue(queue) => queue.close(self, mode),
            Delivery::Spawn(spawn) => spawn.close(self, mode),
            Delivery::Pinned(pinned) => pinned.close(self, mode),
        }
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("address", &self.address)
            .field("strategy", &self.strategy)
            .field("state", &self.lifecycle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wait on `space` for a Block-policy offer
///
/// Returns the error to fail the message with, or `None` once `has_space`
/// holds. `timeout` of `Duration::MAX` (or any value that overflows the
/// clock) waits without a deadline.
fn wait_for_space<T>(
    inbox: &Inbox,
    space: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    timeout: Duration,
    has_space: impl Fn(&T) -> bool,
) -> Option<Error> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if inbox.is_closed() {
            return Some(Error::actor_closed(inbox.address()));
        }
        if has_space(guard) {
            return None;
        }
        match deadline {
            Some(deadline) => {
                if space.wait_until(guard, deadline).timed_out() {
                    if has_space(guard) && !inbox.is_closed() {
                        return None;
                    }
                    return Some(Error::OfferTimedOut {
                        address: inbox.address().to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            None => space.wait(guard),
        }
    }
}

/// Check whether blocking would wait on ourselves
fn offer_is_reentrant(inbox: &Inbox) -> bool {
    Outbox::with_current(|outbox| outbox.is_owned_by(inbox) || outbox.is_running(inbox))
        .unwrap_or(false)
}

/// Invoke, keeping a panic in a lifecycle hook from killing the worker
///
/// Handler panics are already turned into errors at the method boundary;
/// this catches the rest. A reply dropped while unwinding still completes
/// with `ReplyDropped`.
fn invoke_caught(inbox: &Arc<Inbox>, message: Message, cell: &mut ActorCell, outbox: &Outbox) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| message.invoke(inbox, cell, outbox))) {
        error!(
            address = %inbox.address(),
            message = %panic_message(payload.as_ref()),
            "Message handling panicked"
        );
    }
}

// =============================================================================
// Direct
// =============================================================================

struct DirectDelivery {
    cell: Mutex<ActorCell>,
}

impl DirectDelivery {
    fn offer(&self, inbox: &Arc<Inbox>, message: Message) -> bool {
        let reentrant = Outbox::with_current(|outbox| outbox.is_running(inbox)).unwrap_or(false);
        if reentrant {
            // The actor is running further up this thread (A -> B -> A);
            // its cell is held, so run after the chain unwinds
            trace!(address = %inbox.address(), method = %message.method_name(), "Re-entrant direct offer deferred");
            Outbox::with_current(move |outbox| outbox.push(message));
            return true;
        }
        Outbox::run_or_join(None, |outbox| self.invoke(inbox, message, outbox));
        true
    }

    fn invoke(&self, inbox: &Arc<Inbox>, message: Message, outbox: &Outbox) {
        let mut cell = self.cell.lock();
        invoke_caught(inbox, message, &mut cell, outbox);
        cell.after_batch(inbox, outbox);
    }

    fn close(&self, inbox: &Arc<Inbox>, mode: ShutdownMode) {
        self.offer(
            inbox,
            Message::lifecycle(inbox.clone(), Lifecycle::Shutdown(mode)),
        );
    }
}

// =============================================================================
// Queue
// =============================================================================

const WORKER_IDLE: u8 = 0;
const WORKER_SCHEDULED: u8 = 1;
const WORKER_RUNNING: u8 = 2;

/// Bounded mailbox drained by at most one worker at a time
struct QueueDelivery {
    cell: Mutex<ActorCell>,
    mailbox: Mutex<Mailbox<Message>>,
    /// Signalled when a slot frees up or the inbox closes
    space: Condvar,
    worker: AtomicU8,
}

impl QueueDelivery {
    fn offer(
        self: &Arc<Self>,
        inbox: &Arc<Inbox>,
        message: Message,
        timeout: Duration,
    ) -> bool {
        let mut mailbox = self.mailbox.lock();
        let message = match mailbox.push(message) {
            Ok(()) => {
                drop(mailbox);
                self.schedule(inbox);
                return true;
            }
            Err(message) => message,
        };

        match inbox.config().overflow {
            OverflowPolicy::Reject => {
                let error = mailbox_full(inbox, &mailbox);
                drop(mailbox);
                inbox.reject(message, error)
            }
            OverflowPolicy::DropOldest => {
                let evicted = mailbox.evict_oldest();
                let pushed = mailbox.push(message);
                let error = mailbox_full(inbox, &mailbox);
                drop(mailbox);

                if let Some(evicted) = evicted {
                    let dropped = Error::MessageDropped {
                        address: inbox.address().to_string(),
                        method: evicted.method_name().to_string(),
                    };
                    inbox.reject(evicted, dropped);
                }
                match pushed {
                    Ok(()) => {
                        self.schedule(inbox);
                        true
                    }
                    Err(message) => inbox.reject(message, error),
                }
            }
            OverflowPolicy::Block => {
                // Waiting on our own queue would never end
                if timeout.is_zero() || offer_is_reentrant(inbox) {
                    let error = mailbox_full(inbox, &mailbox);
                    drop(mailbox);
                    return inbox.reject(message, error);
                }

                if let Some(error) =
                    wait_for_space(inbox, &self.space, &mut mailbox, timeout, |mailbox| {
                        !mailbox.is_full()
                    })
                {
                    drop(mailbox);
                    return inbox.reject(message, error);
                }

                let pushed = mailbox.push(message);
                let error = mailbox_full(inbox, &mailbox);
                drop(mailbox);
                match pushed {
                    Ok(()) => {
                        self.schedule(inbox);
                        true
                    }
                    Err(message) => inbox.reject(message, error),
                }
            }
        }
    }

    /// Start a worker unless one is already scheduled or running
    fn schedule(self: &Arc<Self>, inbox: &Arc<Inbox>) {
        if self
            .worker
            .compare_exchange(WORKER_IDLE, WORKER_SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let queue = self.clone();
        let target = inbox.clone();
        inbox
            .executor()
            .execute(Box::new(move || queue.drain(&target)));
    }

    /// Worker body: invoke up to one batch in arrival order
    fn drain(self: &Arc<Self>, inbox: &Arc<Inbox>) {
        self.worker.store(WORKER_RUNNING, Ordering::SeqCst);
        let batch_count_max = inbox.config().batch_count_max;
        debug_assert!(batch_count_max > 0);

        Outbox::scope(Some(inbox.clone()), |outbox| {
            let mut count = 0;
            while count < batch_count_max {
                let next = {
                    let mut mailbox = self.mailbox.lock();
                    let next = mailbox.pop();
                    if next.is_some() {
                        self.space.notify_one();
                    }
                    next
                };
                let Some(message) = next else {
                    break;
                };

                {
                    let mut cell = self.cell.lock();
                    invoke_caught(inbox, message, &mut cell, outbox);
                }
                // Flushed with the actor released
                outbox.flush_all();
                count += 1;
            }

            if count > 0 {
                self.cell.lock().after_batch(inbox, outbox);
            }
            trace!(address = %inbox.address(), count, "Batch drained");
        });

        self.worker.store(WORKER_IDLE, Ordering::SeqCst);
        let more = !self.mailbox.lock().is_empty();
        if more {
            self.schedule(inbox);
        }
    }

    fn try_execute_inline(
        self: &Arc<Self>,
        inbox: &Arc<Inbox>,
        message: Message,
        outbox: &Outbox,
    ) -> Result<(), Message> {
        if self
            .worker
            .compare_exchange(WORKER_IDLE, WORKER_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(message);
        }

        let empty = self.mailbox.lock().is_empty();
        if !empty {
            self.worker.store(WORKER_IDLE, Ordering::SeqCst);
            self.schedule(inbox);
            return Err(message);
        }

        {
            let mut cell = self.cell.lock();
            invoke_caught(inbox, message, &mut cell, outbox);
            cell.after_batch(inbox, outbox);
        }

        self.worker.store(WORKER_IDLE, Ordering::SeqCst);
        let more = !self.mailbox.lock().is_empty();
        if more {
            self.schedule(inbox);
        }
        Ok(())
    }

    fn close(self: &Arc<Self>, inbox: &Arc<Inbox>, mode: ShutdownMode) {
        let failed = {
            let mut mailbox = self.mailbox.lock();
            let failed = match mode {
                ShutdownMode::Immediate => mailbox.drain_user(),
                ShutdownMode::Graceful => Vec::new(),
            };
            let pushed = mailbox.push(Message::lifecycle(
                inbox.clone(),
                Lifecycle::Shutdown(mode),
            ));
            debug_assert!(pushed.is_ok(), "lifecycle messages bypass capacity");
            self.space.notify_all();
            failed
        };

        for message in failed {
            inbox.reject(message, Error::actor_closed(inbox.address()));
        }
        self.schedule(inbox);
    }
}

fn mailbox_full(inbox: &Inbox, mailbox: &Mailbox<Message>) -> Error {
    Error::MailboxFull {
        address: inbox.address().to_string(),
        depth: mailbox.len(),
        max: mailbox.capacity(),
    }
}

// =============================================================================
// Spawn
// =============================================================================

/// Each message runs on the executor against a pooled instance
struct SpawnDelivery {
    factory: CellFactory,
    /// Idle instances; never more than `concurrency_max`
    pool: Mutex<Vec<ActorCell>>,
    running: Mutex<usize>,
    space: Condvar,
    concurrency_max: usize,
}

impl SpawnDelivery {
    fn offer(
        self: &Arc<Self>,
        inbox: &Arc<Inbox>,
        message: Message,
        timeout: Duration,
    ) -> bool {
        {
            let mut running = self.running.lock();
            if *running >= self.concurrency_max && !message.is_system() {
                match inbox.config().overflow {
                    OverflowPolicy::Block if !timeout.is_zero() && !offer_is_reentrant(inbox) => {
                        let max = self.concurrency_max;
                        if let Some(error) =
                            wait_for_space(inbox, &self.space, &mut running, timeout, |running| {
                                *running < max
                            })
                        {
                            drop(running);
                            return inbox.reject(message, error);
                        }
                    }
                    // No queue to evict from
                    _ => {
                        let error = Error::MailboxFull {
                            address: inbox.address().to_string(),
                            depth: *running,
                            max: self.concurrency_max,
                        };
                        drop(running);
                        return inbox.reject(message, error);
                    }
                }
            }
            *running += 1;
        }

        let spawn = self.clone();
        let target = inbox.clone();
        inbox
            .executor()
            .execute(Box::new(move || spawn.run(&target, message)));
        true
    }

    fn run(&self, inbox: &Arc<Inbox>, message: Message) {
        let pooled = self.pool.lock().pop();
        let mut cell = pooled.unwrap_or_else(|| (self.factory)());

        Outbox::scope(Some(inbox.clone()), |outbox| {
            invoke_caught(inbox, message, &mut cell, outbox);
            cell.after_batch(inbox, outbox);
        });

        {
            let mut pool = self.pool.lock();
            if inbox.is_closed() {
                drop(pool);
                Outbox::scope(Some(inbox.clone()), |outbox| {
                    cell.shutdown(inbox, outbox, ShutdownMode::Graceful)
                });
            } else {
                pool.push(cell);
            }
        }

        let mut running = self.running.lock();
        debug_assert!(*running > 0);
        *running -= 1;
        self.space.notify_one();
    }

    fn close(&self, inbox: &Arc<Inbox>, mode: ShutdownMode) {
        let idle = std::mem::take(&mut *self.pool.lock());
        Outbox::run_or_join(Some(inbox.clone()), |outbox| {
            for mut cell in idle {
                cell.shutdown(inbox, outbox, mode);
            }
        });

        let _running = self.running.lock();
        self.space.notify_all();
    }
}

// =============================================================================
// Pinned
// =============================================================================

/// Runs a listener's messages through its parent's inbox
struct PinnedDelivery {
    parent: Arc<Inbox>,
    cell: Arc<Mutex<ActorCell>>,
}

impl PinnedDelivery {
    fn wrap(&self, inbox: &Arc<Inbox>, message: Message) -> Message {
        Message::new(
            self.parent.clone(),
            MessageKind::Pinned {
                child: inbox.clone(),
                cell: self.cell.clone(),
                message: Box::new(message),
            },
        )
    }

    fn offer(&self, inbox: &Arc<Inbox>, message: Message, timeout: Duration) -> bool {
        self.parent.offer(self.wrap(inbox, message), timeout)
    }

    fn close(&self, inbox: &Arc<Inbox>, mode: ShutdownMode) {
        let shutdown = Message::lifecycle(inbox.clone(), Lifecycle::Shutdown(mode));
        self.offer(inbox, shutdown, Duration::ZERO);
    }
}
