//! TigerStyle constants for Tidepool
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Service Limits
// =============================================================================

/// Maximum length of a service address in bytes
pub const SERVICE_ADDRESS_LENGTH_BYTES_MAX: usize = 512;

/// Maximum number of services registered with one manager
pub const SERVICES_COUNT_MAX: usize = 1_000_000;

// =============================================================================
// Inbox Limits
// =============================================================================

/// Default depth of a queued inbox
pub const MAILBOX_DEPTH_DEFAULT: usize = 1024;

/// Maximum depth of a queued inbox
pub const MAILBOX_DEPTH_MAX: usize = 65_536;

/// Default time a blocking offer waits for space in milliseconds (10 sec)
pub const OFFER_TIMEOUT_MS_DEFAULT: u64 = 10 * 1000;

/// Maximum messages a worker drains before yielding its executor slot
pub const WORKER_BATCH_COUNT_MAX: usize = 256;

/// Default number of concurrently running instances in a spawn inbox
pub const SPAWN_CONCURRENCY_COUNT_DEFAULT: usize = 16;

/// Maximum number of concurrently running instances in a spawn inbox
pub const SPAWN_CONCURRENCY_COUNT_MAX: usize = 1024;

// =============================================================================
// Outbox Limits
// =============================================================================

/// Maximum messages executed inline by one outbox flush loop
///
/// Beyond this the remaining messages are delivered through their inboxes,
/// which bounds ping-pong chains between two direct actors.
pub const OUTBOX_INLINE_COUNT_MAX: usize = 1024;

// =============================================================================
// Container Limits
// =============================================================================

/// Initial capacity of an actor's child cache
pub const CONTAINER_CHILDREN_COUNT_INITIAL: usize = 64;

/// Maximum capacity of an actor's child cache
pub const CONTAINER_CHILDREN_COUNT_MAX: usize = 16 * 1024;

/// Default number of dirty children that forces an out-of-band save
pub const CONTAINER_MODIFIED_HIGH_WATER_DEFAULT: usize = 1024;

// =============================================================================
// Pipe Limits
// =============================================================================

/// Prefetch credit used when a subscriber asks for the runtime default
pub const PIPE_PREFETCH_DEFAULT: u32 = 32;

/// Prefetch value that selects manual credit management
pub const PIPE_PREFETCH_MANUAL: i32 = -1;

/// Maximum items buffered by a pipe producer ahead of credit
pub const PIPE_BACKLOG_COUNT_MAX: usize = 4096;

// =============================================================================
// Observability - Metric Names (TigerStyle: explicit, with units)
// =============================================================================

/// Metric: Total messages offered to inboxes (counter, labels: strategy)
pub const METRIC_NAME_MESSAGES_OFFERED_TOTAL: &str = "tidepool_messages_offered_total";

/// Metric: Total messages rejected by inboxes (counter, labels: reason)
pub const METRIC_NAME_MESSAGES_REJECTED_TOTAL: &str = "tidepool_messages_rejected_total";

/// Metric: Total invocations (counter, labels: method, status)
pub const METRIC_NAME_INVOCATIONS_TOTAL: &str = "tidepool_invocations_total";

/// Metric: Invocation duration in seconds (histogram)
pub const METRIC_NAME_INVOCATION_DURATION_SECONDS: &str = "tidepool_invocation_duration_seconds";

/// Metric: Total checkpoints (counter, labels: status)
pub const METRIC_NAME_CHECKPOINTS_TOTAL: &str = "tidepool_checkpoints_total";

/// Metric: Total actor activations (counter)
pub const METRIC_NAME_ACTORS_ACTIVATED_TOTAL: &str = "tidepool_actors_activated_total";

// Compile-time assertions for constant validity
const _: () = {
    assert!(SERVICE_ADDRESS_LENGTH_BYTES_MAX >= 64);
    assert!(MAILBOX_DEPTH_DEFAULT > 0);
    assert!(MAILBOX_DEPTH_DEFAULT <= MAILBOX_DEPTH_MAX);
    assert!(SPAWN_CONCURRENCY_COUNT_DEFAULT <= SPAWN_CONCURRENCY_COUNT_MAX);
    assert!(CONTAINER_CHILDREN_COUNT_INITIAL <= CONTAINER_CHILDREN_COUNT_MAX);
    assert!(PIPE_PREFETCH_DEFAULT as usize <= PIPE_BACKLOG_COUNT_MAX);
    assert!(WORKER_BATCH_COUNT_MAX > 0);
};
