//! Actor abstractions for Tidepool
//!
//! TigerStyle: Single-threaded execution per actor, explicit lifecycle hooks.

use std::any::Any;
use std::sync::Arc;

use tidepool_core::error::{Error, Result};
use tidepool_core::reply::Reply;
use tracing::warn;

use crate::container::ActorContainer;
use crate::inbox::Inbox;
use crate::journal::Journal;
use crate::lifecycle::ShutdownMode;
use crate::message::{Headers, Lifecycle, Message, Method, Value};
use crate::method::{Handler, MethodDirectory, MethodKind, MethodTable};
use crate::outbox::{self, Outbox};
use crate::service::ServiceRef;
use crate::services::Services;

// =============================================================================
// Actor Trait
// =============================================================================

/// Actor trait - implement to create actors
///
/// # TigerStyle
/// - Single-threaded execution guarantee (no concurrent invocations)
/// - Lifecycle hooks run through the actor's own inbox
/// - Methods are registered explicitly in [`Actor::methods`]
pub trait Actor: Send + Sized + 'static {
    /// Register the actor's methods
    fn methods(table: &mut MethodTable<Self>);

    /// Called once before the first ordinary message
    fn on_init(&mut self, _ctx: &mut ActorContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called after `on_init` to restore state from the journal
    fn on_replay(&mut self, _ctx: &mut ActorContext<'_>, _journal: &dyn Journal) -> Result<()> {
        Ok(())
    }

    /// Called when the actor becomes active
    fn on_active(&mut self, _ctx: &mut ActorContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Write a checkpoint
    fn on_save(&mut self, _ctx: &mut ActorContext<'_>, _journal: &dyn Journal) -> Result<()> {
        Ok(())
    }

    /// Called when a checkpoint (including children) finished
    fn on_save_complete(&mut self, _ctx: &mut ActorContext<'_>, _succeeded: bool) {}

    /// Called after each drained batch of messages
    fn after_batch(&mut self, _ctx: &mut ActorContext<'_>) {}

    /// Create a child for `path` when the container has none
    fn on_lookup(&mut self, _ctx: &mut ActorContext<'_>, _path: &str) -> Option<ChildActor> {
        None
    }

    /// Called before the actor closes
    fn on_shutdown(&mut self, _ctx: &mut ActorContext<'_>, _mode: ShutdownMode) {}
}

/// Creates actor instances for pooled services
pub trait ActorFactory<A: Actor>: Send + Sync + 'static {
    /// Build a fresh instance
    fn create(&self) -> A;
}

impl<A, F> ActorFactory<A> for F
where
    A: Actor,
    F: Fn() -> A + Send + Sync + 'static,
{
    fn create(&self) -> A {
        self()
    }
}

/// Factory that clones a prototype
#[derive(Debug, Clone)]
pub struct CloneFactory<A> {
    prototype: A,
}

impl<A> CloneFactory<A> {
    /// Create a factory from a prototype instance
    pub fn new(prototype: A) -> Self {
        Self { prototype }
    }
}

impl<A: Actor + Clone + Sync> ActorFactory<A> for CloneFactory<A> {
    fn create(&self) -> A {
        self.prototype.clone()
    }
}

/// A child actor returned from [`Actor::on_lookup`]
pub struct ChildActor {
    stub: Box<dyn ActorStub>,
}

impl ChildActor {
    /// Wrap an actor instance
    pub fn new<A: Actor>(actor: A) -> Self {
        Self {
            stub: Box::new(Stub::new(actor, Arc::new(MethodTable::build()))),
        }
    }

    pub(crate) fn into_stub(self) -> Box<dyn ActorStub> {
        self.stub
    }
}

impl std::fmt::Debug for ChildActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildActor")
            .field("type", &self.stub.directory().type_name())
            .finish()
    }
}

// =============================================================================
// Stub
// =============================================================================

/// Type-erased adapter between an actor instance and the runtime
pub(crate) trait ActorStub: Send {
    fn directory(&self) -> &Arc<MethodDirectory>;
    fn invoke_send(&mut self, method: &Method, ctx: &mut ActorContext<'_>, args: Value)
        -> Result<()>;
    fn invoke_query(
        &mut self,
        method: &Method,
        ctx: &mut ActorContext<'_>,
        args: Value,
        reply: Reply<Value>,
    );
    fn invoke_pipe(
        &mut self,
        method: &Method,
        ctx: &mut ActorContext<'_>,
        args: Value,
        out: Value,
    ) -> Result<()>;
    fn on_init(&mut self, ctx: &mut ActorContext<'_>) -> Result<()>;
    fn on_replay(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()>;
    fn on_active(&mut self, ctx: &mut ActorContext<'_>) -> Result<()>;
    fn on_save(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()>;
    fn on_save_complete(&mut self, ctx: &mut ActorContext<'_>, succeeded: bool);
    fn after_batch(&mut self, ctx: &mut ActorContext<'_>);
    fn on_lookup(&mut self, ctx: &mut ActorContext<'_>, path: &str) -> Option<ChildActor>;
    fn on_shutdown(&mut self, ctx: &mut ActorContext<'_>, mode: ShutdownMode);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct Stub<A: Actor> {
    actor: A,
    table: Arc<MethodTable<A>>,
    directory: Arc<MethodDirectory>,
}

impl<A: Actor> Stub<A> {
    pub(crate) fn new(actor: A, table: Arc<MethodTable<A>>) -> Self {
        let directory = Arc::new(table.directory());
        Self::with_directory(actor, table, directory)
    }

    pub(crate) fn with_directory(
        actor: A,
        table: Arc<MethodTable<A>>,
        directory: Arc<MethodDirectory>,
    ) -> Self {
        Self {
            actor,
            table,
            directory,
        }
    }

    /// Resolve by slot when the caller cached one, else by name
    fn resolve(&self, ctx: &ActorContext<'_>, method: &Method, kind: MethodKind) -> Result<usize> {
        let info = method
            .slot
            .and_then(|slot| self.directory.get_slot(slot, &method.name))
            .or_else(|| self.directory.get(&method.name))
            .ok_or_else(|| Error::MethodNotFound {
                address: ctx.address().to_string(),
                method: method.name.to_string(),
            })?;

        if info.kind != kind {
            return Err(Error::MethodKindMismatch {
                address: ctx.address().to_string(),
                method: method.name.to_string(),
                expected: kind.to_string(),
            });
        }
        Ok(info.slot)
    }
}

impl<A: Actor> ActorStub for Stub<A> {
    fn directory(&self) -> &Arc<MethodDirectory> {
        &self.directory
    }

    fn invoke_send(
        &mut self,
        method: &Method,
        ctx: &mut ActorContext<'_>,
        args: Value,
    ) -> Result<()> {
        let slot = self.resolve(ctx, method, MethodKind::Send)?;
        match self.table.entry(slot).map(|entry| entry.handler()) {
            Some(Handler::Send(handler)) => handler(&mut self.actor, ctx, args),
            _ => Err(Error::internal(format!("slot {} is not a send handler", slot))),
        }
    }

    fn invoke_query(
        &mut self,
        method: &Method,
        ctx: &mut ActorContext<'_>,
        args: Value,
        reply: Reply<Value>,
    ) {
        let slot = match self.resolve(ctx, method, MethodKind::Query) {
            Ok(slot) => slot,
            Err(e) => return reply.fail(e),
        };
        match self.table.entry(slot).map(|entry| entry.handler()) {
            Some(Handler::Query(handler)) => handler(&mut self.actor, ctx, args, reply),
            _ => reply.fail(Error::internal(format!(
                "slot {} is not a query handler",
                slot
            ))),
        }
    }

    fn invoke_pipe(
        &mut self,
        method: &Method,
        ctx: &mut ActorContext<'_>,
        args: Value,
        out: Value,
    ) -> Result<()> {
        let slot = self.resolve(ctx, method, MethodKind::Pipe)?;
        match self.table.entry(slot).map(|entry| entry.handler()) {
            Some(Handler::Pipe(handler)) => handler(&mut self.actor, ctx, args, out),
            _ => Err(Error::internal(format!("slot {} is not a pipe handler", slot))),
        }
    }

    fn on_init(&mut self, ctx: &mut ActorContext<'_>) -> Result<()> {
        self.actor.on_init(ctx)
    }

    fn on_replay(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()> {
        self.actor.on_replay(ctx, journal)
    }

    fn on_active(&mut self, ctx: &mut ActorContext<'_>) -> Result<()> {
        self.actor.on_active(ctx)
    }

    fn on_save(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()> {
        self.actor.on_save(ctx, journal)
    }

    fn on_save_complete(&mut self, ctx: &mut ActorContext<'_>, succeeded: bool) {
        self.actor.on_save_complete(ctx, succeeded)
    }

    fn after_batch(&mut self, ctx: &mut ActorContext<'_>) {
        self.actor.after_batch(ctx)
    }

    fn on_lookup(&mut self, ctx: &mut ActorContext<'_>, path: &str) -> Option<ChildActor> {
        self.actor.on_lookup(ctx, path)
    }

    fn on_shutdown(&mut self, ctx: &mut ActorContext<'_>, mode: ShutdownMode) {
        self.actor.on_shutdown(ctx, mode)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        &mut self.actor
    }
}

// =============================================================================
// ActorContext
// =============================================================================

/// Context provided to an actor while it handles a message
///
/// Provides access to:
/// - The actor's own service handle and manager
/// - Its child container
/// - Headers of the message being handled
/// - Notification fan-out to subscribers
pub struct ActorContext<'a> {
    inbox: &'a Arc<Inbox>,
    outbox: &'a Outbox,
    container: &'a mut ActorContainer,
    headers: &'a Headers,
}

impl<'a> ActorContext<'a> {
    pub(crate) fn new(
        inbox: &'a Arc<Inbox>,
        outbox: &'a Outbox,
        container: &'a mut ActorContainer,
        headers: &'a Headers,
    ) -> Self {
        Self {
            inbox,
            outbox,
            container,
            headers,
        }
    }

    /// Address of the running actor
    pub fn address(&self) -> &str {
        self.inbox.address()
    }

    /// Handle to the running actor
    pub fn service(&self) -> ServiceRef {
        ServiceRef::from_inbox(self.inbox.clone())
    }

    /// The manager the actor belongs to
    pub fn services(&self) -> Option<Services> {
        self.inbox.manager()
    }

    /// Child container
    pub fn container(&mut self) -> &mut ActorContainer {
        self.container
    }

    /// Headers of the message being handled
    pub fn headers(&self) -> &Headers {
        self.headers
    }

    /// Send `value` to the actor's subscribers and one consumer
    ///
    /// Listeners receive it as a send to `method`. Returns the number of
    /// deliveries queued.
    pub fn publish<T>(&mut self, method: &'static str, value: T) -> usize
    where
        T: Clone + Send + 'static,
    {
        // Collected under the registrations lock, dispatched after it is released
        let messages = self.inbox.registrations().lock().publish(method, &value);
        let count = messages.len();
        for message in messages {
            self.outbox.push(message);
        }
        count
    }

    /// A reply whose completion runs back on this actor
    ///
    /// `f` is queued to this actor's inbox, so it never races with the
    /// actor's own handlers. Use it to continue after a query to another
    /// service.
    pub fn then<A, T, F>(&self, f: F) -> Reply<T>
    where
        A: Actor,
        T: Send + 'static,
        F: FnOnce(&mut A, &mut ActorContext<'_>, Result<T>) + Send + 'static,
    {
        let inbox = self.inbox.clone();
        Reply::new(move |result: Result<T>| {
            let callback = Message::callback(
                inbox,
                Box::new(move |stub: &mut dyn ActorStub, ctx: &mut ActorContext<'_>| {
                    match stub.as_any_mut().downcast_mut::<A>() {
                        Some(actor) => f(actor, ctx, result),
                        None => warn!(
                            address = %ctx.address(),
                            expected = std::any::type_name::<A>(),
                            "Callback actor type mismatch"
                        ),
                    }
                }),
            );
            outbox::dispatch(callback);
        })
    }

    /// Mark this actor dirty in its parent's container
    ///
    /// The parent saves this actor on its next checkpoint. Returns false
    /// for actors without a parent.
    pub fn mark_modified(&self) -> bool {
        match self.inbox.parent() {
            Some(parent) => {
                let message = Message::lifecycle(
                    parent.inbox().clone(),
                    Lifecycle::ChildModified(self.service()),
                );
                self.outbox.push(message);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ActorContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("address", &self.address())
            .field("children", &self.container.len())
            .finish()
    }
}
