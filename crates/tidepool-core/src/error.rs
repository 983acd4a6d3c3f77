//! Error types for Tidepool
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use thiserror::Error;

/// Result type alias for Tidepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tidepool error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Service Errors
    // =========================================================================
    #[error("Service not found: {address}")]
    ServiceNotFound { address: String },

    #[error("Service already exists: {address}")]
    ServiceAlreadyExists { address: String },

    #[error("Invalid service address: {address}, reason: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Actor not started: {address}")]
    ActorNotStarted { address: String },

    #[error("Actor closed: {address}")]
    ActorClosed { address: String },

    #[error("Actor activation failed: {address}, reason: {reason}")]
    ActorActivationFailed { address: String, reason: String },

    // =========================================================================
    // Delivery Errors
    // =========================================================================
    #[error("Mailbox full: {address}, depth: {depth}, max: {max}")]
    MailboxFull {
        address: String,
        depth: usize,
        max: usize,
    },

    #[error("Offer timed out: {address} after {timeout_ms}ms")]
    OfferTimedOut { address: String, timeout_ms: u64 },

    #[error("Message dropped: {address}, method: {method}")]
    MessageDropped { address: String, method: String },

    #[error("Message expired: {address}, method: {method}")]
    MessageExpired { address: String, method: String },

    // =========================================================================
    // Invocation Errors
    // =========================================================================
    #[error("Method not found: {address}, method: {method}")]
    MethodNotFound { address: String, method: String },

    #[error("Method kind mismatch: {address}, method: {method}, expected: {expected}")]
    MethodKindMismatch {
        address: String,
        method: String,
        expected: String,
    },

    #[error("Argument mismatch: {address}, method: {method}, expected: {expected}")]
    ArgumentMismatch {
        address: String,
        method: String,
        expected: String,
    },

    #[error("Invocation failed: {address}, method: {method}, reason: {reason}")]
    InvocationFailed {
        address: String,
        method: String,
        reason: String,
    },

    #[error("Handler panicked: {address}, method: {method}, message: {message}")]
    HandlerPanicked {
        address: String,
        method: String,
        message: String,
    },

    #[error("Reply dropped before completion")]
    ReplyDropped,

    // =========================================================================
    // Usage Errors
    // =========================================================================
    #[error("Illegal argument: {reason}")]
    IllegalArgument { reason: String },

    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("Proxy unavailable: {interface}, reason: {reason}")]
    ProxyUnavailable { interface: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Pipe Errors
    // =========================================================================
    #[error("Pipe closed")]
    PipeClosed,

    #[error("Pipe backlog full: {count} items (limit: {limit})")]
    PipeBacklogFull { count: usize, limit: usize },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Checkpoint failed: {address}, reason: {reason}")]
    CheckpointFailed { address: String, reason: String },

    #[error("Journal failed: {name}, reason: {reason}")]
    JournalFailed { name: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("Deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a service not found error
    pub fn service_not_found(address: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            address: address.into(),
        }
    }

    /// Create an actor closed error
    pub fn actor_closed(address: impl Into<String>) -> Self {
        Self::ActorClosed {
            address: address.into(),
        }
    }

    /// Create an invocation failed error
    pub fn invocation_failed(
        address: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvocationFailed {
            address: address.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create an illegal argument error
    pub fn illegal_argument(reason: impl Into<String>) -> Self {
        Self::IllegalArgument {
            reason: reason.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    /// Create a checkpoint failed error
    pub fn checkpoint_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CheckpointFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Check if this error is retriable
    ///
    /// Backpressure rejections clear once the target drains its queue.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::MailboxFull { .. } | Self::OfferTimedOut { .. } | Self::MessageDropped { .. }
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::ServiceAlreadyExists { .. } => "service_already_exists",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::ActorNotStarted { .. } => "actor_not_started",
            Self::ActorClosed { .. } => "actor_closed",
            Self::ActorActivationFailed { .. } => "activation_failed",
            Self::MailboxFull { .. } => "mailbox_full",
            Self::OfferTimedOut { .. } => "offer_timed_out",
            Self::MessageDropped { .. } => "message_dropped",
            Self::MessageExpired { .. } => "message_expired",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::MethodKindMismatch { .. } => "method_kind_mismatch",
            Self::ArgumentMismatch { .. } => "argument_mismatch",
            Self::InvocationFailed { .. } => "invocation_failed",
            Self::HandlerPanicked { .. } => "handler_panicked",
            Self::ReplyDropped => "reply_dropped",
            Self::IllegalArgument { .. } => "illegal_argument",
            Self::IllegalState { .. } => "illegal_state",
            Self::ProxyUnavailable { .. } => "proxy_unavailable",
            Self::Cancelled => "cancelled",
            Self::PipeClosed => "pipe_closed",
            Self::PipeBacklogFull { .. } => "pipe_backlog_full",
            Self::CheckpointFailed { .. } => "checkpoint_failed",
            Self::JournalFailed { .. } => "journal_failed",
            Self::InvalidConfiguration { .. } => "invalid_configuration",
            Self::Internal { .. } => "internal",
            Self::SerializationFailed { .. } => "serialization_failed",
            Self::DeserializationFailed { .. } => "deserialization_failed",
            Self::Other(_) => "other",
        }
    }
}
