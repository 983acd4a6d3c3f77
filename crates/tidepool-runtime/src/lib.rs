//! Tidepool Runtime
//!
//! In-process actor runtime: inboxes, outboxes, and service handles.
//!
//! # Overview
//!
//! The runtime provides:
//! - Service registration by address ([`Services`])
//! - Four delivery strategies behind one inbox contract
//! - A per-thread outbox that batches messages sent from handlers
//! - Actor lifecycle with checkpoints through a [`Journal`]
//! - Child containers, pinned listeners, publish/subscribe
//! - Flow-controlled pipes and typed proxies
//!
//! # TigerStyle
//! - At most one message runs per actor at any instant
//! - Bounded mailboxes (overflow is a policy, never silent)
//! - Explicit lifecycle states

pub mod actor;
pub mod container;
mod inbox;
pub mod journal;
pub mod lifecycle;
mod mailbox;
pub mod message;
pub mod method;
pub mod outbox;
pub mod pipe;
pub mod proxy;
pub mod service;
pub mod services;
mod subscription;

pub use actor::{Actor, ActorContext, ActorFactory, ChildActor, CloneFactory};
pub use container::ActorContainer;
pub use inbox::InboxStats;
pub use journal::{
    read_json, write_json, Journal, JournalProvider, MemoryJournal, MemoryJournalProvider,
    NoopJournal,
};
pub use lifecycle::{LifecycleState, ShutdownMode};
pub use message::{Headers, Message, MessageState, Value};
pub use method::{MethodDirectory, MethodEntry, MethodInfo, MethodKind, MethodTable};
pub use outbox::{batch, Outbox};
pub use pipe::{pipe_fn, FnSubscriber, PipeFlow, PipeOut, PipeSubscriber};
pub use proxy::{Proxy, ProxyBinding, ProxyTable};
pub use service::ServiceRef;
pub use services::{ServiceBuilder, Services, ServicesBuilder};

pub use tidepool_core::{
    Cancel, ContainerConfig, DeliveryStrategy, Error, Executor, InboxConfig, InlineExecutor,
    ManualClock, ManualExecutor, OverflowPolicy, PipeConfig, Reply, ReplyReceiver, Result,
    RuntimeConfig, TimeProvider, TokioExecutor, WallClockTime,
};
