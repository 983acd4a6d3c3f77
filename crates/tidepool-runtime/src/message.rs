//! Messages
//!
//! TigerStyle: Every message is delivered at most once and its completion
//! target fires exactly once.
//!
//! A message is an addressed unit of work: target inbox, method, argument
//! value, headers, optional expiry and a completion target. Its state only
//! moves forward: `Created -> Queued -> Invoking -> Completed{Ok,Fail}`, or
//! `Created -> Invoking` when executed inline.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidepool_core::cancel::Cancel;
use tidepool_core::error::{Error, Result};
use tidepool_core::metrics;
use tidepool_core::reply::Reply;
use tracing::{debug, error, trace, warn};

use crate::actor::{ActorContext, ActorStub};
use crate::inbox::Inbox;
use crate::lifecycle::{ActorCell, ShutdownMode};
use crate::method::panic_message;
use crate::outbox::Outbox;
use crate::pipe::PipeCall;
use crate::service::ServiceRef;
use crate::subscription::ListenerMode;

/// Type-erased argument or result value
pub type Value = Box<dyn Any + Send>;

static MESSAGE_ID_NEXT: AtomicU64 = AtomicU64::new(1);

/// Message state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Built, not yet accepted by an inbox
    Created,
    /// Waiting in an inbox queue
    Queued,
    /// Handler running
    Invoking,
    /// Handler finished without error
    CompletedOk,
    /// Handler failed, or the message was rejected
    CompletedFail,
}

impl MessageState {
    /// Check if valid forward transition
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Invoking)
                | (Created, CompletedFail)
                | (Queued, Invoking)
                | (Queued, CompletedFail)
                | (Invoking, CompletedOk)
                | (Invoking, CompletedFail)
        )
    }

    /// True once the message reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::CompletedOk | MessageState::CompletedFail)
    }
}

/// String headers carried with a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Set a header, replacing an existing value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Read a header
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Method identity with an optional resolved slot
#[derive(Debug, Clone)]
pub(crate) struct Method {
    pub(crate) name: Cow<'static, str>,
    pub(crate) slot: Option<usize>,
}

impl Method {
    pub(crate) fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            slot: None,
        }
    }
}

/// Lifecycle messages carry no user arguments
pub(crate) enum Lifecycle {
    Init,
    Active,
    SaveRequest(Reply<()>),
    SaveComplete { succeeded: bool },
    Lookup { path: String, reply: Reply<ServiceRef> },
    ChildModified(ServiceRef),
    Shutdown(ShutdownMode),
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Init => "on_init",
            Lifecycle::Active => "on_active",
            Lifecycle::SaveRequest(_) => "on_save_request",
            Lifecycle::SaveComplete { .. } => "on_save_complete",
            Lifecycle::Lookup { .. } => "on_lookup",
            Lifecycle::ChildModified(_) => "on_child_modified",
            Lifecycle::Shutdown(_) => "on_shutdown",
        }
    }
}

type Callback = Box<dyn FnOnce(&mut dyn ActorStub, &mut ActorContext<'_>) + Send + 'static>;

pub(crate) enum MessageKind {
    Send {
        method: Method,
        args: Value,
        guard: Option<Cancel>,
    },
    Query {
        method: Method,
        args: Value,
        reply: Reply<Value>,
    },
    Pipe {
        method: Method,
        args: Value,
        out: Value,
        call: PipeCall,
    },
    Subscribe {
        listener: ServiceRef,
        mode: ListenerMode,
        cancel: Cancel,
    },
    Lifecycle(Lifecycle),
    Callback(Callback),
    Pinned {
        child: Arc<Inbox>,
        cell: Arc<Mutex<ActorCell>>,
        message: Box<Message>,
    },
}

/// An addressed unit of work
pub struct Message {
    id: u64,
    inbox: Arc<Inbox>,
    kind: MessageKind,
    headers: Headers,
    expires_at_ms: Option<u64>,
    created_at_ms: u64,
    state: MessageState,
}

impl Message {
    pub(crate) fn new(inbox: Arc<Inbox>, kind: MessageKind) -> Self {
        let created_at_ms = inbox.time().monotonic_ms();
        Self {
            id: MESSAGE_ID_NEXT.fetch_add(1, Ordering::Relaxed),
            inbox,
            kind,
            headers: Headers::default(),
            expires_at_ms: None,
            created_at_ms,
            state: MessageState::Created,
        }
    }

    /// Build a fire-and-forget message
    pub fn send<P: Send + 'static>(
        target: &ServiceRef,
        method: impl Into<Cow<'static, str>>,
        args: P,
    ) -> Self {
        Self::new(
            target.inbox().clone(),
            MessageKind::Send {
                method: Method::named(method),
                args: Box::new(args),
                guard: None,
            },
        )
    }

    /// Build a query whose typed result completes `reply`
    pub fn query<P, R>(
        target: &ServiceRef,
        method: impl Into<Cow<'static, str>>,
        args: P,
        reply: Reply<R>,
    ) -> Self
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let method = Method::named(method);
        let reply = erase_reply(target.address(), &method.name, reply);
        Self::new(
            target.inbox().clone(),
            MessageKind::Query {
                method,
                args: Box::new(args),
                reply,
            },
        )
    }

    pub(crate) fn lifecycle(inbox: Arc<Inbox>, lifecycle: Lifecycle) -> Self {
        Self::new(inbox, MessageKind::Lifecycle(lifecycle))
    }

    pub(crate) fn callback(inbox: Arc<Inbox>, callback: Callback) -> Self {
        Self::new(inbox, MessageKind::Callback(callback))
    }

    pub(crate) fn with_slot(mut self, slot: usize) -> Self {
        match self.kind {
            MessageKind::Send { ref mut method, .. }
            | MessageKind::Query { ref mut method, .. }
            | MessageKind::Pipe { ref mut method, .. } => method.slot = Some(slot),
            _ => {}
        }
        self
    }

    pub(crate) fn with_guard(mut self, cancel: Cancel) -> Self {
        if let MessageKind::Send { ref mut guard, .. } = self.kind {
            *guard = Some(cancel);
        }
        self
    }

    /// Attach a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Expire the message if it has not started running within `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.expires_at_ms = Some(self.created_at_ms.saturating_add(timeout_ms));
        self
    }

    /// Unique message id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target address
    pub fn address(&self) -> &str {
        self.inbox.address()
    }

    /// Method or lifecycle hook name
    pub fn method_name(&self) -> &str {
        match &self.kind {
            MessageKind::Send { method, .. }
            | MessageKind::Query { method, .. }
            | MessageKind::Pipe { method, .. } => &method.name,
            MessageKind::Subscribe { .. } => "subscribe",
            MessageKind::Lifecycle(lifecycle) => lifecycle.name(),
            MessageKind::Callback(_) => "callback",
            MessageKind::Pinned { message, .. } => message.method_name(),
        }
    }

    /// Message kind label
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            MessageKind::Send { .. } => "send",
            MessageKind::Query { .. } => "query",
            MessageKind::Pipe { .. } => "pipe",
            MessageKind::Subscribe { .. } => "subscribe",
            MessageKind::Lifecycle(_) => "lifecycle",
            MessageKind::Callback(_) => "callback",
            MessageKind::Pinned { .. } => "pinned",
        }
    }

    /// Current state
    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Lifecycle and internal messages bypass capacity and closed checks
    pub(crate) fn is_system(&self) -> bool {
        match &self.kind {
            MessageKind::Lifecycle(_) => true,
            MessageKind::Pinned { message, .. } => message.is_system(),
            _ => false,
        }
    }

    pub(crate) fn mark_queued(&mut self) {
        self.transition(MessageState::Queued);
    }

    fn transition(&mut self, next: MessageState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid message transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn is_expired(&self) -> bool {
        match self.expires_at_ms {
            Some(deadline) => self.inbox.time().monotonic_ms() > deadline,
            None => false,
        }
    }

    /// Fail the message's completion target without running it
    pub fn fail(mut self, error: Error) {
        if !self.state.is_terminal() {
            self.transition(MessageState::CompletedFail);
        }
        let address = self.inbox.address().to_string();
        match self.kind {
            MessageKind::Send { method, .. } => {
                debug!(address = %address, method = %method.name, error = %error, "Send dropped");
            }
            MessageKind::Query { reply, .. } => reply.fail(error),
            MessageKind::Pipe { call, .. } => call.end(Err(error)),
            MessageKind::Subscribe { cancel, .. } => {
                cancel.cancel();
            }
            MessageKind::Lifecycle(Lifecycle::SaveRequest(reply)) => reply.fail(error),
            MessageKind::Lifecycle(Lifecycle::Lookup { reply, .. }) => reply.fail(error),
            MessageKind::Lifecycle(lifecycle) => {
                trace!(address = %address, hook = lifecycle.name(), "Lifecycle message dropped");
            }
            MessageKind::Callback(_) => {
                warn!(address = %address, error = %error, "Callback dropped");
            }
            MessageKind::Pinned { message, .. } => (*message).fail(error),
        }
    }

    /// Run the message against an actor cell, returning its terminal state
    ///
    /// The caller holds the cell for the duration of the call, which is
    /// what makes handler execution serial per actor. A query whose reply
    /// is deferred counts as `CompletedOk` once its handler returned.
    pub(crate) fn invoke(self, inbox: &Arc<Inbox>, cell: &mut ActorCell, outbox: &Outbox) -> MessageState {
        let mut message = self;

        if let MessageKind::Pinned {
            child,
            cell: child_cell,
            message: inner,
        } = message.kind
        {
            let mut child_guard = child_cell.lock();
            return (*inner).invoke(&child, &mut child_guard, outbox);
        }

        if message.is_expired() {
            let error = Error::MessageExpired {
                address: inbox.address().to_string(),
                method: message.method_name().to_string(),
            };
            inbox.record_rejected(&error);
            message.fail(error);
            return MessageState::CompletedFail;
        }

        message.transition(MessageState::Invoking);
        let _current = outbox.enter(inbox.clone());
        let id = message.id;
        let headers = std::mem::take(&mut message.headers);

        let ok = match message.kind {
            MessageKind::Lifecycle(lifecycle) => {
                cell.handle_lifecycle(inbox, outbox, lifecycle);
                true
            }
            MessageKind::Subscribe {
                listener,
                mode,
                cancel,
            } => {
                inbox.registrations().lock().add(mode, listener, cancel);
                true
            }
            MessageKind::Callback(callback) => {
                let (stub, container) = cell.parts();
                let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
                match catch_unwind(AssertUnwindSafe(|| callback(stub, &mut ctx))) {
                    Ok(()) => true,
                    Err(payload) => {
                        error!(
                            address = %inbox.address(),
                            message = %panic_message(payload.as_ref()),
                            "Callback panicked"
                        );
                        false
                    }
                }
            }
            MessageKind::Send {
                method,
                args,
                guard,
            } => {
                if guard.as_ref().is_some_and(Cancel::is_cancelled) {
                    trace!(address = %inbox.address(), method = %method.name, "Skipping cancelled delivery");
                    return MessageState::CompletedFail;
                }
                if let Err(e) = cell.ensure_active(inbox, outbox) {
                    warn!(address = %inbox.address(), method = %method.name, error = %e, "Send dropped");
                    return MessageState::CompletedFail;
                }
                let started = Instant::now();
                let (stub, container) = cell.parts();
                let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
                let result = stub.invoke_send(&method, &mut ctx, args);
                finish(inbox, id, &method, started, &result)
            }
            MessageKind::Query {
                method,
                args,
                reply,
            } => {
                if let Err(e) = cell.ensure_active(inbox, outbox) {
                    reply.fail(e);
                    return MessageState::CompletedFail;
                }
                let started = Instant::now();
                let (stub, container) = cell.parts();
                let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
                let outcome = Arc::new(Mutex::new(None));
                let observed = outcome.clone();
                let reply = Reply::new(move |result: Result<Value>| {
                    *observed.lock() = Some(result.is_ok());
                    reply.handle(result);
                });
                stub.invoke_query(&method, &mut ctx, args, reply);
                let ok = outcome.lock().unwrap_or(true);
                let result = if ok {
                    Ok(())
                } else {
                    Err(Error::invocation_failed(
                        inbox.address(),
                        method.name.as_ref(),
                        "query failed",
                    ))
                };
                finish(inbox, id, &method, started, &result)
            }
            MessageKind::Pipe {
                method,
                args,
                out,
                call,
            } => {
                if let Err(e) = cell.ensure_active(inbox, outbox) {
                    call.end(Err(e));
                    return MessageState::CompletedFail;
                }
                let started = Instant::now();
                let (stub, container) = cell.parts();
                let mut ctx = ActorContext::new(inbox, outbox, container, &headers);
                call.begin();
                let result = stub.invoke_pipe(&method, &mut ctx, args, out);
                let ok = finish(inbox, id, &method, started, &result);
                call.end(result);
                ok
            }
            MessageKind::Pinned { .. } => unreachable!("pinned messages are unwrapped above"),
        };

        if ok {
            MessageState::CompletedOk
        } else {
            MessageState::CompletedFail
        }
    }
}

/// Record a handler outcome; returns true when it succeeded
fn finish(inbox: &Inbox, id: u64, method: &Method, started: Instant, result: &Result<()>) -> bool {
    let duration = started.elapsed().as_secs_f64();
    inbox.record_processed();
    match result {
        Ok(()) => {
            metrics::record_invocation(&method.name, "success", duration);
            trace!(address = %inbox.address(), message_id = id, method = %method.name, "Invocation completed");
            true
        }
        Err(e) => {
            metrics::record_invocation(&method.name, "error", duration);
            error!(
                address = %inbox.address(),
                message_id = id,
                method = %method.name,
                error = %e,
                "Invocation failed"
            );
            false
        }
    }
}

/// Wrap a typed reply so the runtime can complete it with an erased value
fn erase_reply<R: Send + 'static>(address: &str, method: &str, reply: Reply<R>) -> Reply<Value> {
    let address = address.to_string();
    let method = method.to_string();
    reply.of_result(move |value: Value| {
        value
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::ArgumentMismatch {
                address,
                method,
                expected: std::any::type_name::<R>().to_string(),
            })
    })
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("kind", &self.kind_name())
            .field("method", &self.method_name())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::config::{ContainerConfig, DeliveryStrategy};
    use tidepool_core::executor::InlineExecutor;

    use crate::actor::{Actor, Stub};
    use crate::method::MethodTable;
    use crate::services::Services;

    struct Gauge {
        level: u64,
    }

    impl Actor for Gauge {
        fn methods(table: &mut MethodTable<Self>) {
            table.send("raise", |gauge: &mut Gauge, _ctx, amount: u64| {
                gauge.level += amount;
                Ok(())
            });
            table.query("level", |gauge: &mut Gauge, _ctx, (): ()| Ok(gauge.level));
            table.query("broken", |_gauge: &mut Gauge, _ctx, (): ()| -> Result<u64> {
                Err(Error::illegal_state("gauge stuck"))
            });
        }
    }

    /// Run `message` against a fresh `Gauge` cell
    fn run(service: &ServiceRef, cell: &mut ActorCell, message: Message) -> MessageState {
        assert_eq!(message.state(), MessageState::Created);
        Outbox::scope(None, |outbox| message.invoke(service.inbox(), cell, outbox))
    }

    #[test]
    fn test_invoke_reaches_terminal_state() {
        let services = Services::builder()
            .executor(Arc::new(InlineExecutor))
            .build()
            .unwrap();
        let service = services
            .new_service(Gauge { level: 0 })
            .address("/gauge")
            .strategy(DeliveryStrategy::Direct)
            .build()
            .unwrap();
        let stub = Stub::new(Gauge { level: 0 }, Arc::new(MethodTable::build()));
        let mut cell = ActorCell::new(Box::new(stub), &ContainerConfig::default());

        let raised = run(&service, &mut cell, Message::send(&service, "raise", 3u64));
        assert_eq!(raised, MessageState::CompletedOk);

        let (reply, rx) = Reply::<u64>::channel();
        let level = run(&service, &mut cell, Message::query(&service, "level", (), reply));
        assert_eq!(level, MessageState::CompletedOk);
        assert_eq!(rx.blocking_recv().unwrap(), 3u64);

        let (reply, rx) = Reply::<u64>::channel();
        let broken = run(&service, &mut cell, Message::query(&service, "broken", (), reply));
        assert_eq!(broken, MessageState::CompletedFail);
        assert!(rx.blocking_recv().is_err());

        let missing = run(&service, &mut cell, Message::send(&service, "missing", ()));
        assert_eq!(missing, MessageState::CompletedFail);
        assert!(missing.is_terminal());
    }

    #[test]
    fn test_state_transitions() {
        use MessageState::*;
        assert!(Created.can_transition_to(Queued));
        assert!(Created.can_transition_to(Invoking));
        assert!(Queued.can_transition_to(Invoking));
        assert!(Invoking.can_transition_to(CompletedOk));
        assert!(Invoking.can_transition_to(CompletedFail));
        assert!(Queued.can_transition_to(CompletedFail));

        assert!(!Invoking.can_transition_to(Queued));
        assert!(!CompletedOk.can_transition_to(Invoking));
        assert!(!CompletedFail.can_transition_to(CompletedOk));
        assert!(CompletedOk.is_terminal());
        assert!(!Queued.is_terminal());
    }

    #[test]
    fn test_headers_insert_replaces() {
        let mut headers = Headers::default();
        assert!(headers.is_empty());
        headers.insert("trace", "a");
        headers.insert("tenant", "acme");
        headers.insert("trace", "b");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("trace"), Some("b"));
        assert_eq!(headers.get("missing"), None);
    }
}
