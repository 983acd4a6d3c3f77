//! Tidepool Core
//!
//! Core types, errors, and constants for the Tidepool actor runtime.
//!
//! # Overview
//!
//! Tidepool runs actors in-process. Each actor is reached only through
//! messages placed in its inbox, and the runtime guarantees that at most one
//! message is being handled by a given actor at any instant. This crate
//! holds the pieces shared by every layer: the error taxonomy, limits,
//! configuration, the executor seam, completion callbacks (`Reply`) and
//! cancellation handles.
//!
//! # TigerStyle
//!
//! - Explicit limits with big-endian naming (e.g., `MAILBOX_DEPTH_MAX`)
//! - Assertions on invariants
//! - Bounded loops only

pub mod cancel;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod io;
pub mod metrics;
pub mod reply;
pub mod telemetry;

pub use cancel::Cancel;
pub use config::{
    ContainerConfig, DeliveryStrategy, InboxConfig, OverflowPolicy, PipeConfig, RuntimeConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use executor::{Executor, InlineExecutor, ManualExecutor, Task, TokioExecutor};
pub use io::{ManualClock, TimeProvider, WallClockTime};
pub use reply::{Reply, ReplyReceiver};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
