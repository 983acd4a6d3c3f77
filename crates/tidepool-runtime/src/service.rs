//! Service handles
//!
//! TigerStyle: Every call becomes a message; the handle never touches the
//! actor directly.
//!
//! A [`ServiceRef`] is a cheap, cloneable handle over one inbox. Calls made
//! from inside a handler are collected in the running outbox and delivered
//! after the handler returns; calls made elsewhere are offered at once.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tidepool_core::cancel::Cancel;
use tidepool_core::config::DeliveryStrategy;
use tidepool_core::error::{Error, Result};
use tidepool_core::reply::{Reply, ReplyReceiver};
use tracing::debug;

use crate::actor::{Actor, ActorStub, Stub};
use crate::inbox::{DeliveryKind, Inbox, InboxParts, InboxStats};
use crate::lifecycle::{ActorCell, LifecycleState, ShutdownMode};
use crate::message::{Lifecycle, Message, MessageKind, Method};
use crate::method::{MethodDirectory, MethodKind, MethodTable};
use crate::outbox::{self, Outbox};
use crate::pipe::{self, PipeFlow, PipeSubscriber};
use crate::proxy::{Proxy, ProxyBinding};
use crate::services::Services;
use crate::subscription::ListenerMode;

/// Handle to a running service
#[derive(Clone)]
pub struct ServiceRef {
    inbox: Arc<Inbox>,
}

impl ServiceRef {
    pub(crate) fn from_inbox(inbox: Arc<Inbox>) -> Self {
        Self { inbox }
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Service address
    pub fn address(&self) -> &str {
        self.inbox.address()
    }

    /// The manager the service was registered with
    pub fn manager(&self) -> Option<Services> {
        self.inbox.manager()
    }

    /// Delivery strategy (a pinned service reports its parent's)
    pub fn strategy(&self) -> DeliveryStrategy {
        self.inbox.strategy()
    }

    /// Lifecycle state as last observed through the inbox
    pub fn lifecycle(&self) -> LifecycleState {
        self.inbox.lifecycle()
    }

    /// Check whether the service was closed
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Inbox counters
    pub fn stats(&self) -> InboxStats {
        self.inbox.stats()
    }

    /// Live subscribers and consumers registered with the service
    pub fn listener_count(&self) -> usize {
        self.inbox.registrations().lock().listener_count()
    }

    /// Pipe flows the service is still feeding
    pub fn pipe_count(&self) -> usize {
        self.inbox.registrations().lock().pipe_count()
    }

    /// Methods the service's actor registered
    pub fn methods(&self) -> &MethodDirectory {
        self.inbox.directory()
    }

    /// The service whose handler is running on this call stack
    pub fn current() -> Option<ServiceRef> {
        Outbox::current_inbox().map(ServiceRef::from_inbox)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Fire-and-forget call
    ///
    /// Returns false when the inbox refused the message outright.
    pub fn send<P>(&self, method: impl Into<Cow<'static, str>>, args: P) -> bool
    where
        P: Send + 'static,
    {
        let message = Message::send(self, method, args);
        let direct = self.is_direct(message.method_name());
        self.deliver(message, direct)
    }

    /// Call with exactly one reply
    ///
    /// A refused message fails `reply` before this returns.
    pub fn query<P, R>(
        &self,
        method: impl Into<Cow<'static, str>>,
        args: P,
        reply: Reply<R>,
    ) -> bool
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let message = Message::query(self, method, args, reply);
        let direct = self.is_direct(message.method_name());
        self.deliver(message, direct)
    }

    /// Query and await the reply
    pub fn call<P, R>(&self, method: impl Into<Cow<'static, str>>, args: P) -> ReplyReceiver<R>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let (reply, receiver) = Reply::channel();
        self.query(method, args, reply);
        receiver
    }

    /// Start a streaming call delivering to `subscriber`
    ///
    /// Closing this service cancels the flow.
    pub fn pipe<P, T, S>(&self, method: impl Into<Cow<'static, str>>, args: P, subscriber: S) -> PipeFlow
    where
        P: Send + 'static,
        T: Send + 'static,
        S: PipeSubscriber<T>,
    {
        self.pipe_message(Method::named(method), args, subscriber)
    }

    /// Offer a prebuilt message with an explicit Block-policy timeout
    pub fn offer(&self, message: Message, timeout: Duration) -> bool {
        if !Arc::ptr_eq(message.inbox(), &self.inbox) {
            let error = Error::illegal_argument(format!(
                "message for {} offered to {}",
                message.address(),
                self.address()
            ));
            message.fail(error);
            return false;
        }
        self.inbox.offer(message, timeout)
    }

    pub(crate) fn send_slot<P>(&self, name: &'static str, slot: usize, direct: bool, args: P) -> bool
    where
        P: Send + 'static,
    {
        let message = Message::send(self, name, args).with_slot(slot);
        self.deliver(message, direct)
    }

    pub(crate) fn query_slot<P, R>(
        &self,
        name: &'static str,
        slot: usize,
        direct: bool,
        args: P,
        reply: Reply<R>,
    ) -> bool
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let message = Message::query(self, name, args, reply).with_slot(slot);
        self.deliver(message, direct)
    }

    pub(crate) fn pipe_slot<P, T, S>(&self, name: &'static str, slot: usize, args: P, subscriber: S) -> PipeFlow
    where
        P: Send + 'static,
        T: Send + 'static,
        S: PipeSubscriber<T>,
    {
        let method = Method {
            name: Cow::Borrowed(name),
            slot: Some(slot),
        };
        self.pipe_message(method, args, subscriber)
    }

    fn pipe_message<P, T, S>(&self, method: Method, args: P, subscriber: S) -> PipeFlow
    where
        P: Send + 'static,
        T: Send + 'static,
        S: PipeSubscriber<T>,
    {
        let (out, flow) = pipe::channel(subscriber, self.inbox.pipe_config(), self.address());
        let call = out.call_handle();
        let cancel = flow.cancel_handle();
        self.inbox.registrations().lock().track(cancel.clone());

        // A finished pipe no longer needs cancelling when the service closes
        let inbox = Arc::downgrade(&self.inbox);
        out.on_finished(move || {
            if let Some(inbox) = inbox.upgrade() {
                inbox.registrations().lock().untrack(&cancel);
            }
        });

        let message = Message::new(
            self.inbox.clone(),
            MessageKind::Pipe {
                method,
                args: Box::new(args),
                out: Box::new(out),
                call,
            },
        );
        outbox::dispatch(message);
        flow
    }

    fn is_direct(&self, name: &str) -> bool {
        self.inbox
            .directory()
            .get(name)
            .is_some_and(|info| info.direct)
    }

    /// Try the direct fast path, else hand the message to the outbox
    fn deliver(&self, message: Message, direct: bool) -> bool {
        let message = if direct {
            match self.inbox.try_invoke_direct(message) {
                Ok(()) => return true,
                Err(message) => message,
            }
        } else {
            message
        };
        outbox::dispatch(message)
    }

    // =========================================================================
    // Proxies
    // =========================================================================

    /// Typed proxy over this service
    ///
    /// Fails with `ProxyUnavailable` when the actor does not serve every
    /// method of `P`, and with `IllegalArgument` for `ServiceRef` itself.
    pub fn as_proxy<P: Proxy>(&self) -> Result<P> {
        if TypeId::of::<P>() == TypeId::of::<ServiceRef>() {
            return Err(Error::illegal_argument(format!(
                "{} is already a ServiceRef",
                self.address()
            )));
        }
        let services = self
            .manager()
            .ok_or_else(|| Error::illegal_state("service manager was dropped"))?;
        let table = services.proxies().table::<P>(self.inbox.directory())?;
        Ok(P::bind(ProxyBinding::new(self.clone(), table)))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Derive a service whose handlers run serialized with this one
    ///
    /// Messages to the pinned service travel through this service's inbox
    /// and run while this actor is held, so `listener` can share state
    /// with it without locks.
    pub fn pin<A: Actor>(&self, listener: A) -> Result<ServiceRef> {
        if self.is_closed() {
            return Err(Error::actor_closed(self.address()));
        }

        let stub = Stub::new(listener, Arc::new(MethodTable::<A>::build()));
        let directory = stub.directory().clone();
        let cell = ActorCell::new(Box::new(stub), self.inbox.container_config());
        let address = format!("{}#pin-{}", self.address(), self.inbox.next_pin_id());

        let parts = InboxParts {
            address,
            config: self.inbox.config().clone(),
            directory,
            manager: self.inbox.manager_weak(),
            parent: None,
            journal: self.inbox.journal().clone(),
            time: self.inbox.time().clone(),
            executor: self.inbox.executor().clone(),
            container: self.inbox.container_config().clone(),
            pipe: self.inbox.pipe_config().clone(),
        };
        let pinned = ServiceRef::from_inbox(Inbox::new(
            parts,
            DeliveryKind::Pinned {
                parent: self.inbox.clone(),
                cell,
            },
        ));
        debug!(address = %pinned.address(), "Listener pinned");
        pinned.start();
        Ok(pinned)
    }

    /// Receive every notification this service publishes
    pub fn subscribe(&self, listener: &ServiceRef) -> Cancel {
        self.register(listener, ListenerMode::Subscribe)
    }

    /// Share this service's notifications with other consumers
    pub fn consume(&self, listener: &ServiceRef) -> Cancel {
        self.register(listener, ListenerMode::Consume)
    }

    fn register(&self, listener: &ServiceRef, mode: ListenerMode) -> Cancel {
        let cancel = Cancel::new();
        let message = Message::new(
            self.inbox.clone(),
            MessageKind::Subscribe {
                listener: listener.clone(),
                mode,
                cancel: cancel.clone(),
            },
        );
        outbox::dispatch(message);
        cancel
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run `on_init`, journal replay and `on_active`; later calls do nothing
    pub fn start(&self) {
        if !self.inbox.mark_started() {
            return;
        }
        outbox::dispatch(Message::lifecycle(self.inbox.clone(), Lifecycle::Init));
        outbox::dispatch(Message::lifecycle(self.inbox.clone(), Lifecycle::Active));
    }

    /// Request a checkpoint
    ///
    /// `reply` completes once the actor's `on_save` returned and every
    /// dirty child saved.
    pub fn save(&self, reply: Reply<()>) {
        if self.is_closed() {
            return reply.fail(Error::actor_closed(self.address()));
        }
        outbox::dispatch(Message::lifecycle(
            self.inbox.clone(),
            Lifecycle::SaveRequest(reply),
        ));
    }

    /// Resolve a child by path, creating it through `on_lookup` on a miss
    pub fn lookup(&self, path: impl Into<String>, reply: Reply<ServiceRef>) {
        if self.is_closed() {
            return reply.fail(Error::actor_closed(self.address()));
        }
        let path = path.into();
        if path.is_empty() {
            return reply.fail(Error::illegal_argument("lookup path must not be empty"));
        }
        outbox::dispatch(Message::lifecycle(
            self.inbox.clone(),
            Lifecycle::Lookup { path, reply },
        ));
    }

    /// Close after queued messages ran
    pub fn close(&self) {
        self.shutdown(ShutdownMode::Graceful);
    }

    /// Close the service
    pub fn shutdown(&self, mode: ShutdownMode) {
        if let Some(services) = self.manager() {
            services.unregister(self);
        }
        self.inbox.shutdown(mode);
    }
}

impl PartialEq for ServiceRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inbox, &other.inbox)
    }
}

impl Eq for ServiceRef {}

impl fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRef")
            .field("address", &self.address())
            .field("strategy", &self.strategy())
            .field("state", &self.lifecycle())
            .finish()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl Proxy for ServiceRef {
    const INTERFACE: &'static str = "ServiceRef";

    fn methods() -> &'static [(&'static str, MethodKind)] {
        &[]
    }

    fn bind(binding: ProxyBinding) -> Self {
        binding.service().clone()
    }
}
