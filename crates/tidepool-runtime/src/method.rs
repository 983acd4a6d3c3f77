//! Per-actor method tables
//!
//! TigerStyle: Dispatch is an explicit table built once per actor type.
//!
//! Each actor type registers its handlers in `Actor::methods`. The table
//! keeps the typed handlers; a non-generic [`MethodDirectory`] describes
//! them (name, kind, direct flag, slot) so inboxes and proxies can resolve
//! calls without knowing the actor type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tidepool_core::error::{Error, Result};
use tidepool_core::reply::Reply;

use crate::actor::{Actor, ActorContext};
use crate::message::Value;
use crate::pipe::PipeOut;

/// How a method is called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Fire-and-forget
    Send,
    /// Exactly one reply
    Query,
    /// Streams values to a subscriber
    Pipe,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKind::Send => write!(f, "send"),
            MethodKind::Query => write!(f, "query"),
            MethodKind::Pipe => write!(f, "pipe"),
        }
    }
}

/// Description of one registered method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name
    pub name: &'static str,
    /// Call shape
    pub kind: MethodKind,
    /// Whether callers may execute it on their own thread
    pub direct: bool,
    /// Index in the actor's table
    pub slot: usize,
}

/// Type-erased view of an actor type's methods
#[derive(Debug)]
pub struct MethodDirectory {
    actor_type: TypeId,
    type_name: &'static str,
    methods: Vec<MethodInfo>,
    by_name: HashMap<&'static str, usize>,
}

impl MethodDirectory {
    /// The actor type this directory describes
    pub fn actor_type(&self) -> TypeId {
        self.actor_type
    }

    /// Rust type name of the actor
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Look a method up by name
    pub fn get(&self, name: &str) -> Option<&MethodInfo> {
        self.by_name.get(name).map(|slot| &self.methods[*slot])
    }

    /// Look a method up by slot, checking the name still matches
    pub fn get_slot(&self, slot: usize, name: &str) -> Option<&MethodInfo> {
        self.methods.get(slot).filter(|info| info.name == name)
    }

    /// All registered methods in slot order
    pub fn iter(&self) -> impl Iterator<Item = &MethodInfo> {
        self.methods.iter()
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True when the actor registered no methods
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

// =============================================================================
// Handlers
// =============================================================================

type SendHandler<A> =
    Box<dyn Fn(&mut A, &mut ActorContext<'_>, Value) -> Result<()> + Send + Sync + 'static>;
type QueryHandler<A> =
    Box<dyn Fn(&mut A, &mut ActorContext<'_>, Value, Reply<Value>) + Send + Sync + 'static>;
type PipeHandler<A> =
    Box<dyn Fn(&mut A, &mut ActorContext<'_>, Value, Value) -> Result<()> + Send + Sync + 'static>;

pub(crate) enum Handler<A> {
    Send(SendHandler<A>),
    Query(QueryHandler<A>),
    Pipe(PipeHandler<A>),
}

/// One registered method
pub struct MethodEntry<A> {
    name: &'static str,
    direct: bool,
    handler: Handler<A>,
}

impl<A> MethodEntry<A> {
    /// Allow callers to run this method inline on their own thread
    ///
    /// The actor lock is still taken (without waiting), so calls never
    /// overlap; only FIFO order relative to queued messages is skipped.
    /// Use it for methods whose result does not depend on queued traffic.
    pub fn direct(&mut self) -> &mut Self {
        self.direct = true;
        self
    }

    pub(crate) fn handler(&self) -> &Handler<A> {
        &self.handler
    }

    fn kind(&self) -> MethodKind {
        match self.handler {
            Handler::Send(_) => MethodKind::Send,
            Handler::Query(_) => MethodKind::Query,
            Handler::Pipe(_) => MethodKind::Pipe,
        }
    }
}

/// Method table for one actor type
pub struct MethodTable<A> {
    entries: Vec<MethodEntry<A>>,
}

impl<A: Actor> MethodTable<A> {
    pub(crate) fn build() -> Self {
        let mut table = Self {
            entries: Vec::new(),
        };
        A::methods(&mut table);
        table
    }

    fn register(&mut self, name: &'static str, handler: Handler<A>) -> &mut MethodEntry<A> {
        assert!(!name.is_empty(), "method name must not be empty");
        assert!(
            self.entries.iter().all(|e| e.name != name),
            "method {} registered twice",
            name
        );

        self.entries.push(MethodEntry {
            name,
            direct: false,
            handler,
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    /// Register a fire-and-forget method
    pub fn send<P, F>(&mut self, name: &'static str, f: F) -> &mut MethodEntry<A>
    where
        P: Send + 'static,
        F: Fn(&mut A, &mut ActorContext<'_>, P) -> Result<()> + Send + Sync + 'static,
    {
        let handler: SendHandler<A> = Box::new(
            move |actor: &mut A, ctx: &mut ActorContext<'_>, args: Value| {
                let args = downcast_args::<P>(ctx, name, args)?;
                guard(ctx, name, |ctx| f(actor, ctx, args))
            },
        );
        self.register(name, Handler::Send(handler))
    }

    /// Register a method whose return value completes the reply
    pub fn query<P, R, F>(&mut self, name: &'static str, f: F) -> &mut MethodEntry<A>
    where
        P: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut A, &mut ActorContext<'_>, P) -> Result<R> + Send + Sync + 'static,
    {
        let handler: QueryHandler<A> = Box::new(
            move |actor: &mut A, ctx: &mut ActorContext<'_>, args: Value, reply: Reply<Value>| {
                let result = downcast_args::<P>(ctx, name, args)
                    .and_then(|args| guard(ctx, name, |ctx| f(actor, ctx, args)));
                reply.handle(result.map(|value| Box::new(value) as Value));
            },
        );
        self.register(name, Handler::Query(handler))
    }

    /// Register a method that completes its reply itself, possibly later
    ///
    /// The handler owns the reply. If it drops the reply without completing
    /// it, the caller observes `Error::ReplyDropped`; if it panics first,
    /// `Error::HandlerPanicked`.
    pub fn query_deferred<P, R, F>(&mut self, name: &'static str, f: F) -> &mut MethodEntry<A>
    where
        P: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut A, &mut ActorContext<'_>, P, Reply<R>) + Send + Sync + 'static,
    {
        let handler: QueryHandler<A> = Box::new(
            move |actor: &mut A, ctx: &mut ActorContext<'_>, args: Value, reply: Reply<Value>| {
                let args = match downcast_args::<P>(ctx, name, args) {
                    Ok(args) => args,
                    Err(e) => return reply.fail(e),
                };

                let pending = Arc::new(Mutex::new(Some(reply)));
                let forward = pending.clone();
                let typed = Reply::new(move |result: Result<R>| {
                    // Dropped while the handler unwinds: `guard` reports the panic
                    if matches!(result, Err(Error::ReplyDropped)) && std::thread::panicking() {
                        return;
                    }
                    let reply = forward.lock().take();
                    if let Some(reply) = reply {
                        reply.handle(result.map(|value| Box::new(value) as Value));
                    }
                });

                let invoked = guard(ctx, name, |ctx| {
                    f(actor, ctx, args, typed);
                    Ok(())
                });
                if let Err(e) = invoked {
                    let reply = pending.lock().take();
                    if let Some(reply) = reply {
                        reply.fail(e);
                    }
                }
            },
        );
        self.register(name, Handler::Query(handler))
    }

    /// Register a streaming method
    pub fn pipe<P, T, F>(&mut self, name: &'static str, f: F) -> &mut MethodEntry<A>
    where
        P: Send + 'static,
        T: Send + 'static,
        F: Fn(&mut A, &mut ActorContext<'_>, P, PipeOut<T>) -> Result<()> + Send + Sync + 'static,
    {
        let handler: PipeHandler<A> = Box::new(
            move |actor: &mut A, ctx: &mut ActorContext<'_>, args: Value, out: Value| {
                let args = downcast_args::<P>(ctx, name, args)?;
                let out = out
                    .downcast::<PipeOut<T>>()
                    .map_err(|_| Error::ArgumentMismatch {
                        address: ctx.address().to_string(),
                        method: name.to_string(),
                        expected: std::any::type_name::<PipeOut<T>>().to_string(),
                    })?;
                guard(ctx, name, |ctx| f(actor, ctx, args, *out))
            },
        );
        self.register(name, Handler::Pipe(handler))
    }

    pub(crate) fn entry(&self, slot: usize) -> Option<&MethodEntry<A>> {
        self.entries.get(slot)
    }

    pub(crate) fn directory(&self) -> MethodDirectory {
        let methods: Vec<MethodInfo> = self
            .entries
            .iter()
            .enumerate()
            .map(|(slot, entry)| MethodInfo {
                name: entry.name,
                kind: entry.kind(),
                direct: entry.direct,
                slot,
            })
            .collect();
        let by_name = methods.iter().map(|info| (info.name, info.slot)).collect();

        MethodDirectory {
            actor_type: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
            methods,
            by_name,
        }
    }
}

fn downcast_args<P: 'static>(ctx: &ActorContext<'_>, method: &str, args: Value) -> Result<P> {
    args.downcast::<P>()
        .map(|boxed| *boxed)
        .map_err(|_| Error::ArgumentMismatch {
            address: ctx.address().to_string(),
            method: method.to_string(),
            expected: std::any::type_name::<P>().to_string(),
        })
}

/// Run a handler, turning a panic into `HandlerPanicked`
fn guard<R>(
    ctx: &mut ActorContext<'_>,
    method: &str,
    f: impl FnOnce(&mut ActorContext<'_>) -> Result<R>,
) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
        Ok(result) => result,
        Err(payload) => Err(Error::HandlerPanicked {
            address: ctx.address().to_string(),
            method: method.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
