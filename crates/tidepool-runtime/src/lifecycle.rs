//! Actor lifecycle management
//!
//! TigerStyle: Explicit lifecycle states, transitions only through the
//! actor's own inbox.
//!
//! Every lifecycle step runs as a message on the actor's inbox, so an actor
//! never observes `on_active` concurrently with a user message.
//!
//! State transitions:
//! ```text
//!   New -> Initializing -> Initialized -> Active <-> Saving
//!    ^          |               |            |
//!    +----------+---------------+            v
//!     (failed init)                       Closing -> Closed
//! ```

use std::fmt;
use std::sync::Arc;

use tidepool_core::config::ContainerConfig;
use tidepool_core::error::{Error, Result};
use tidepool_core::metrics;
use tidepool_core::reply::Reply;
use tracing::{debug, info, instrument, warn};

use crate::actor::{ActorContext, ActorStub};
use crate::container::ActorContainer;
use crate::inbox::Inbox;
use crate::message::{Headers, Lifecycle, Message};
use crate::outbox::{self, Outbox};
use crate::service::ServiceRef;

/// Actor lifecycle state as observed through its inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Registered, `on_init` not run yet
    #[default]
    New,
    /// Running `on_init` and journal replay
    Initializing,
    /// Initialized, waiting for `on_active`
    Initialized,
    /// Accepting ordinary messages
    Active,
    /// Writing a checkpoint (transient)
    Saving,
    /// Running shutdown hooks
    Closing,
    /// Closed; ordinary messages fail
    Closed,
}

impl LifecycleState {
    /// Check if valid transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (New, Initializing) => true,
            (Initializing, Initialized) | (Initializing, New) => true,
            (Initialized, Active) | (Initialized, New) => true,
            (Active, Saving) | (Saving, Active) => true,
            (New, Closing) | (Initialized, Closing) | (Active, Closing) => true,
            (Closing, Closed) => true,
            _ if *self == next => true,
            _ => false,
        }
    }

    /// Check if ordinary messages can run
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Saving)
    }

    /// Check if the actor is closing or closed
    pub fn is_closed(&self) -> bool {
        matches!(self, LifecycleState::Closing | LifecycleState::Closed)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LifecycleState::New => 0,
            LifecycleState::Initializing => 1,
            LifecycleState::Initialized => 2,
            LifecycleState::Active => 3,
            LifecycleState::Saving => 4,
            LifecycleState::Closing => 5,
            LifecycleState::Closed => 6,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::New,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Initialized,
            3 => LifecycleState::Active,
            4 => LifecycleState::Saving,
            5 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::New => write!(f, "new"),
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Initialized => write!(f, "initialized"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Saving => write!(f, "saving"),
            LifecycleState::Closing => write!(f, "closing"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

/// How to shut an actor down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Run queued messages first
    #[default]
    Graceful,
    /// Fail queued messages with `ActorClosed`
    Immediate,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Graceful => write!(f, "graceful"),
            ShutdownMode::Immediate => write!(f, "immediate"),
        }
    }
}

// =============================================================================
// ActorCell
// =============================================================================

/// One actor instance plus the state the runtime keeps beside it
///
/// Whoever holds `&mut ActorCell` is the only thread running the actor.
pub(crate) struct ActorCell {
    stub: Box<dyn ActorStub>,
    container: ActorContainer,
    state: LifecycleState,
}

impl ActorCell {
    pub(crate) fn new(stub: Box<dyn ActorStub>, config: &ContainerConfig) -> Self {
        Self {
            stub,
            container: ActorContainer::new(config),
            state: LifecycleState::New,
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    /// Split borrow for building an `ActorContext`
    pub(crate) fn parts(&mut self) -> (&mut dyn ActorStub, &mut ActorContainer) {
        (self.stub.as_mut(), &mut self.container)
    }

    fn transition(&mut self, inbox: &Inbox, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid lifecycle transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        inbox.observe_state(next);
    }

    /// Bring the actor to `Active`, running any hooks not yet run
    pub(crate) fn ensure_active(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox) -> Result<()> {
        match self.state {
            LifecycleState::Active | LifecycleState::Saving => Ok(()),
            LifecycleState::Closing | LifecycleState::Closed => {
                Err(Error::actor_closed(inbox.address()))
            }
            LifecycleState::New => {
                self.initialize(inbox, outbox)?;
                self.activate(inbox, outbox)
            }
            LifecycleState::Initializing => Err(Error::illegal_state(format!(
                "actor {} re-entered initialization",
                inbox.address()
            ))),
            LifecycleState::Initialized => self.activate(inbox, outbox),
        }
    }

    #[instrument(skip(self, inbox, outbox), fields(address = %inbox.address()), level = "info")]
    fn initialize(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox) -> Result<()> {
        debug_assert_eq!(self.state, LifecycleState::New);
        self.transition(inbox, LifecycleState::Initializing);

        let headers = Headers::default();
        let journal = inbox.journal().clone();
        let result = {
            let (stub, container) = self.parts();
            let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
            let mut result = stub.on_init(&mut ctx);
            if result.is_ok() {
                result = stub.on_replay(&mut ctx, journal.as_ref());
            }
            result
        };

        match result {
            Ok(()) => {
                self.transition(inbox, LifecycleState::Initialized);
                debug!(address = %inbox.address(), "Actor initialized");
                Ok(())
            }
            Err(e) => {
                self.transition(inbox, LifecycleState::New);
                warn!(address = %inbox.address(), error = %e, "Actor initialization failed");
                Err(Error::ActorActivationFailed {
                    address: inbox.address().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn activate(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox) -> Result<()> {
        debug_assert_eq!(self.state, LifecycleState::Initialized);

        let headers = Headers::default();
        let result = {
            let (stub, container) = self.parts();
            let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
            stub.on_active(&mut ctx)
        };

        match result {
            Ok(()) => {
                self.transition(inbox, LifecycleState::Active);
                metrics::record_actor_activated();
                info!(address = %inbox.address(), strategy = %inbox.strategy(), "Actor active");
                Ok(())
            }
            Err(e) => {
                self.transition(inbox, LifecycleState::New);
                warn!(address = %inbox.address(), error = %e, "Actor activation failed");
                Err(Error::ActorActivationFailed {
                    address: inbox.address().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub(crate) fn handle_lifecycle(
        &mut self,
        inbox: &Arc<Inbox>,
        outbox: &Outbox,
        lifecycle: Lifecycle,
    ) {
        match lifecycle {
            Lifecycle::Init => {
                if self.state == LifecycleState::New {
                    // Failure is logged; the next message retries
                    let _ = self.initialize(inbox, outbox);
                }
            }
            Lifecycle::Active => {
                if let Err(e) = self.ensure_active(inbox, outbox) {
                    debug!(address = %inbox.address(), error = %e, "Start deferred");
                }
            }
            Lifecycle::SaveRequest(reply) => self.save(inbox, outbox, reply),
            Lifecycle::SaveComplete { succeeded } => {
                if self.state.is_active() {
                    let headers = Headers::default();
                    let (stub, container) = self.parts();
                    let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
                    stub.on_save_complete(&mut ctx, succeeded);
                }
            }
            Lifecycle::Lookup { path, reply } => self.lookup(inbox, outbox, path, reply),
            Lifecycle::ChildModified(child) => {
                if self.state.is_closed() {
                    return;
                }
                let owner = ServiceRef::from_inbox(inbox.clone());
                self.container.add_modified_child(child, &owner);
            }
            Lifecycle::Shutdown(mode) => self.shutdown(inbox, outbox, mode),
        }
    }

    /// Run `after_batch` on an active actor
    pub(crate) fn after_batch(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox) {
        if !self.state.is_active() {
            return;
        }
        let headers = Headers::default();
        let (stub, container) = self.parts();
        let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
        stub.after_batch(&mut ctx);
    }

    /// Checkpoint the actor and its dirty children
    ///
    /// `reply` completes once the actor's own `on_save` returned and every
    /// dirty child finished its save. A `SaveComplete` notice then goes back
    /// through this inbox.
    #[instrument(skip(self, inbox, outbox, reply), fields(address = %inbox.address()), level = "info")]
    fn save(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox, reply: Reply<()>) {
        match self.state {
            LifecycleState::Active => {}
            LifecycleState::Closing | LifecycleState::Closed => {
                return reply.fail(Error::actor_closed(inbox.address()));
            }
            _ => {
                return reply.fail(Error::ActorNotStarted {
                    address: inbox.address().to_string(),
                });
            }
        }

        self.transition(inbox, LifecycleState::Saving);

        let notify = inbox.clone();
        let address = inbox.address().to_string();
        let joined: Reply<Vec<()>> = Reply::new(move |result: Result<Vec<()>>| {
            let succeeded = result.is_ok();
            match &result {
                Ok(_) => metrics::record_checkpoint("success"),
                Err(e) => {
                    metrics::record_checkpoint("failure");
                    warn!(address = %address, error = %e, "Checkpoint failed");
                }
            }
            outbox::dispatch(Message::lifecycle(
                notify,
                Lifecycle::SaveComplete { succeeded },
            ));
            reply.handle(result.map(|_| ()));
        });

        let mut branches = joined.fork(2);
        let own = branches.pop();
        let children = branches.pop();

        if let Some(children) = children {
            self.container.on_save(children);
        }

        if let Some(own) = own {
            let headers = Headers::default();
            let journal = inbox.journal().clone();
            let (stub, container) = self.parts();
            let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
            match stub.on_save(&mut ctx, journal.as_ref()) {
                Ok(()) => own.ok(()),
                Err(e) => own.fail(Error::checkpoint_failed(inbox.address(), e.to_string())),
            }
        }

        self.transition(inbox, LifecycleState::Active);
    }

    fn lookup(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox, path: String, reply: Reply<ServiceRef>) {
        if let Some(child) = self.container.get_service(&path) {
            return reply.ok(child);
        }

        if let Err(e) = self.ensure_active(inbox, outbox) {
            return reply.fail(e);
        }

        let created = {
            let headers = Headers::default();
            let (stub, container) = self.parts();
            let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
            stub.on_lookup(&mut ctx, &path)
        };

        let Some(child) = created else {
            return reply.fail(Error::service_not_found(format!(
                "{}/{}",
                inbox.address(),
                path
            )));
        };

        let Some(services) = inbox.manager() else {
            return reply.fail(Error::illegal_state("service manager was dropped"));
        };

        match services.create_child(inbox, &path, child) {
            Ok(service) => {
                debug!(address = %inbox.address(), path = %path, "Child created");
                self.container.add_service(path, service.clone());
                reply.ok(service);
            }
            Err(e) => reply.fail(e),
        }
    }

    #[instrument(skip(self, inbox, outbox), fields(address = %inbox.address()), level = "info")]
    pub(crate) fn shutdown(&mut self, inbox: &Arc<Inbox>, outbox: &Outbox, mode: ShutdownMode) {
        if self.state.is_closed() {
            return;
        }
        let was_active = self.state.is_active();
        if self.state == LifecycleState::Saving {
            self.transition(inbox, LifecycleState::Active);
        }
        self.transition(inbox, LifecycleState::Closing);

        if was_active {
            let headers = Headers::default();
            let (stub, container) = self.parts();
            let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
            stub.on_shutdown(&mut ctx, mode);
        }

        self.container.shutdown_children(mode);
        let cancels = inbox.registrations().lock().close_all();
        for cancel in cancels {
            cancel.cancel();
        }

        self.transition(inbox, LifecycleState::Closed);
        info!(address = %inbox.address(), mode = %mode, "Actor closed");
    }
}

impl fmt::Debug for ActorCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCell")
            .field("type", &self.stub.directory().type_name())
            .field("state", &self.state)
            .field("children", &self.container.len())
            .finish()
    }
}
