//! Configuration for Tidepool
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a Tidepool service manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default inbox settings for new services
    #[serde(default)]
    pub inbox: InboxConfig,

    /// Child container settings
    #[serde(default)]
    pub container: ContainerConfig,

    /// Pipe flow-control settings
    #[serde(default)]
    pub pipe: PipeConfig,

    /// Subscriber settings, applied by `init_telemetry`
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Parse configuration from a JSON document, filling in defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::DeserializationFailed {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.inbox.validate()?;
        self.container.validate()?;
        self.pipe.validate()?;
        Ok(())
    }
}

/// How messages reach an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// Invoke synchronously on the offering thread
    Direct,
    /// Bounded FIFO queue drained by a single worker
    #[default]
    Queue,
    /// Each message runs on its own pooled instance
    Spawn,
}

impl std::fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStrategy::Direct => write!(f, "direct"),
            DeliveryStrategy::Queue => write!(f, "queue"),
            DeliveryStrategy::Spawn => write!(f, "spawn"),
        }
    }
}

/// What a full queue does with a new offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the new message immediately
    Reject,
    /// Wait up to the offer timeout for space
    #[default]
    Block,
    /// Evict and fail the oldest queued message
    DropOldest,
}

/// Inbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Delivery strategy
    #[serde(default)]
    pub strategy: DeliveryStrategy,

    /// Queue capacity (Queue strategy)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Overflow policy when the queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// How long a blocking offer waits (milliseconds); 0 means do not wait
    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,

    /// Messages drained per worker turn
    #[serde(default = "default_batch_count_max")]
    pub batch_count_max: usize,

    /// Concurrent instances (Spawn strategy)
    #[serde(default = "default_spawn_concurrency")]
    pub spawn_concurrency_max: usize,
}

fn default_capacity() -> usize {
    MAILBOX_DEPTH_DEFAULT
}

fn default_offer_timeout_ms() -> u64 {
    OFFER_TIMEOUT_MS_DEFAULT
}

fn default_batch_count_max() -> usize {
    WORKER_BATCH_COUNT_MAX
}

fn default_spawn_concurrency() -> usize {
    SPAWN_CONCURRENCY_COUNT_DEFAULT
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            strategy: DeliveryStrategy::default(),
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
            offer_timeout_ms: default_offer_timeout_ms(),
            batch_count_max: default_batch_count_max(),
            spawn_concurrency_max: default_spawn_concurrency(),
        }
    }
}

impl InboxConfig {
    /// Offer timeout as a duration
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAILBOX_DEPTH_MAX {
            return Err(Error::InvalidConfiguration {
                field: "inbox.capacity".into(),
                reason: format!("{} not in 1..={}", self.capacity, MAILBOX_DEPTH_MAX),
            });
        }

        if self.batch_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "inbox.batch_count_max".into(),
                reason: "must be positive".into(),
            });
        }

        if self.spawn_concurrency_max == 0
            || self.spawn_concurrency_max > SPAWN_CONCURRENCY_COUNT_MAX
        {
            return Err(Error::InvalidConfiguration {
                field: "inbox.spawn_concurrency_max".into(),
                reason: format!(
                    "{} not in 1..={}",
                    self.spawn_concurrency_max, SPAWN_CONCURRENCY_COUNT_MAX
                ),
            });
        }

        Ok(())
    }
}

/// Child container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Initial child cache capacity
    #[serde(default = "default_children_initial")]
    pub children_count_initial: usize,

    /// Maximum child cache capacity
    #[serde(default = "default_children_max")]
    pub children_count_max: usize,

    /// Dirty children count that forces a save of the parent
    #[serde(default = "default_modified_high_water")]
    pub modified_high_water: usize,
}

fn default_children_initial() -> usize {
    CONTAINER_CHILDREN_COUNT_INITIAL
}

fn default_children_max() -> usize {
    CONTAINER_CHILDREN_COUNT_MAX
}

fn default_modified_high_water() -> usize {
    CONTAINER_MODIFIED_HIGH_WATER_DEFAULT
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            children_count_initial: default_children_initial(),
            children_count_max: default_children_max(),
            modified_high_water: default_modified_high_water(),
        }
    }
}

impl ContainerConfig {
    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.children_count_initial == 0 {
            return Err(Error::InvalidConfiguration {
                field: "container.children_count_initial".into(),
                reason: "must be positive".into(),
            });
        }

        if self.children_count_initial > self.children_count_max {
            return Err(Error::InvalidConfiguration {
                field: "container.children_count_initial".into(),
                reason: "must not exceed children_count_max".into(),
            });
        }

        if self.children_count_max > CONTAINER_CHILDREN_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "container.children_count_max".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.children_count_max, CONTAINER_CHILDREN_COUNT_MAX
                ),
            });
        }

        if self.modified_high_water == 0 {
            return Err(Error::InvalidConfiguration {
                field: "container.modified_high_water".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(())
    }
}

/// Pipe flow-control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Credit granted when a subscriber asks for the default prefetch
    #[serde(default = "default_prefetch")]
    pub prefetch_default: u32,

    /// Items a producer may buffer ahead of credit
    #[serde(default = "default_backlog")]
    pub backlog_count_max: usize,
}

fn default_prefetch() -> u32 {
    PIPE_PREFETCH_DEFAULT
}

fn default_backlog() -> usize {
    PIPE_BACKLOG_COUNT_MAX
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            prefetch_default: default_prefetch(),
            backlog_count_max: default_backlog(),
        }
    }
}

impl PipeConfig {
    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.prefetch_default == 0 {
            return Err(Error::InvalidConfiguration {
                field: "pipe.prefetch_default".into(),
                reason: "must be positive".into(),
            });
        }

        if self.backlog_count_max == 0 || self.backlog_count_max > PIPE_BACKLOG_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "pipe.backlog_count_max".into(),
                reason: format!(
                    "{} not in 1..={}",
                    self.backlog_count_max, PIPE_BACKLOG_COUNT_MAX
                ),
            });
        }

        Ok(())
    }
}
