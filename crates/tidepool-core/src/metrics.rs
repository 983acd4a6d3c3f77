//! Metrics collection for Tidepool
//!
//! TigerStyle: Explicit metric names with units, type-safe recording.
//!
//! Recording functions are always callable. They feed OpenTelemetry
//! instruments when the `otel` feature is enabled and do nothing otherwise.

#[cfg(feature = "otel")]
use crate::constants::*;
#[cfg(feature = "otel")]
use once_cell::sync::Lazy;
#[cfg(feature = "otel")]
use opentelemetry::metrics::{Counter, Histogram};
#[cfg(feature = "otel")]
use opentelemetry::{global, KeyValue};

#[cfg(feature = "otel")]
const METER_NAME: &str = "tidepool";

#[cfg(feature = "otel")]
static MESSAGES_OFFERED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_MESSAGES_OFFERED_TOTAL)
        .with_description("Total messages offered to inboxes")
        .init()
});

#[cfg(feature = "otel")]
static MESSAGES_REJECTED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_MESSAGES_REJECTED_TOTAL)
        .with_description("Total messages rejected by inboxes")
        .init()
});

#[cfg(feature = "otel")]
static INVOCATIONS_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_INVOCATIONS_TOTAL)
        .with_description("Total handler invocations")
        .init()
});

#[cfg(feature = "otel")]
static INVOCATION_DURATION_HISTOGRAM: Lazy<Histogram<f64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .f64_histogram(METRIC_NAME_INVOCATION_DURATION_SECONDS)
        .with_description("Handler invocation duration in seconds")
        .init()
});

#[cfg(feature = "otel")]
static CHECKPOINTS_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_CHECKPOINTS_TOTAL)
        .with_description("Total actor checkpoints")
        .init()
});

#[cfg(feature = "otel")]
static ACTORS_ACTIVATED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_ACTORS_ACTIVATED_TOTAL)
        .with_description("Total actor activations")
        .init()
});

/// Record a message accepted by an inbox
///
/// * `strategy` - "direct", "queue" or "spawn"
#[cfg(feature = "otel")]
pub fn record_message_offered(strategy: &str) {
    MESSAGES_OFFERED_COUNTER.add(1, &[KeyValue::new("strategy", strategy.to_string())]);
}

/// Record a message an inbox refused or evicted
///
/// * `reason` - error kind, e.g. "mailbox_full"
#[cfg(feature = "otel")]
pub fn record_message_rejected(reason: &str) {
    MESSAGES_REJECTED_COUNTER.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a handler invocation
///
/// * `method` - method name
/// * `status` - "success" or "error"
/// * `duration_seconds` - wall time spent in the handler
#[cfg(feature = "otel")]
pub fn record_invocation(method: &str, status: &str, duration_seconds: f64) {
    INVOCATIONS_COUNTER.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", status.to_string()),
        ],
    );
    INVOCATION_DURATION_HISTOGRAM.record(
        duration_seconds,
        &[KeyValue::new("method", method.to_string())],
    );
}

/// Record a checkpoint outcome
#[cfg(feature = "otel")]
pub fn record_checkpoint(status: &str) {
    CHECKPOINTS_COUNTER.add(1, &[KeyValue::new("status", status.to_string())]);
}

/// Record an actor reaching the active state
#[cfg(feature = "otel")]
pub fn record_actor_activated() {
    ACTORS_ACTIVATED_COUNTER.add(1, &[]);
}

// No-op implementations when otel feature is disabled
#[cfg(not(feature = "otel"))]
pub fn record_message_offered(_strategy: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_message_rejected(_reason: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_invocation(_method: &str, _status: &str, _duration_seconds: f64) {}

#[cfg(not(feature = "otel"))]
pub fn record_checkpoint(_status: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_actor_activated() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_functions_dont_panic() {
        record_message_offered("queue");
        record_message_rejected("mailbox_full");
        record_invocation("echo", "success", 0.001);
        record_checkpoint("success");
        record_actor_activated();
    }
}
