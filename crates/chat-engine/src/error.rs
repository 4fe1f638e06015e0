use thiserror::Error;

/// Error types for chat engine operations
///
/// Covers everything that can go wrong while coordinating presence, queueing,
/// and conversation routing. Several variants are *expected* outcomes of
/// concurrent operation rather than failures: losing an accept race yields
/// [`RoutingConflict`](ChatEngineError::RoutingConflict), an agent at maximum
/// load yields [`CapacityExceeded`](ChatEngineError::CapacityExceeded), and
/// contention on tenant state yields [`Timeout`](ChatEngineError::Timeout).
/// Callers are expected to translate these into user-visible messaging
/// ("conversation already taken") rather than retry blindly.
///
/// # Examples
///
/// ```
/// use livedesk_chat_engine::{ChatEngineError, Result};
///
/// fn accept() -> Result<()> {
///     Err(ChatEngineError::routing_conflict("conversation already taken"))
/// }
///
/// match accept() {
///     Ok(_) => println!("accepted"),
///     Err(ChatEngineError::RoutingConflict(msg)) => println!("lost the race: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum ChatEngineError {
    /// Unknown agent, conversation, tenant, or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lost an accept/transfer race — expected, not exceptional
    ///
    /// The referenced conversation was taken by another agent, or the
    /// supplied assignment version is stale. The caller should inform the
    /// user that the conversation is no longer available.
    #[error("Routing conflict: {0}")]
    RoutingConflict(String),

    /// Agent is at `max_concurrent_conversations`
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Ticket state machine rejected the requested transition
    ///
    /// # Examples
    /// - Transferring a ticket that has already Ended
    /// - Activating a ticket still Waiting in the queue
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Cross-tenant access attempt
    ///
    /// An operation under one tenant referenced presence or queue state
    /// belonging to another tenant. Always a caller bug, never retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Lock or queue contention exceeded the configured bound
    ///
    /// Retry-safe: no state was mutated. Internal lock details are not
    /// exposed in the message.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Tenant queue is at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal errors indicating a bug or corrupted state
    ///
    /// Detected invariant violations (e.g. a ticket observed with two
    /// owners) surface through this variant after the ticket has been
    /// forced back to Waiting.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatEngineError {
    /// Create a new NotFound error with the provided message
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new RoutingConflict error with the provided message
    pub fn routing_conflict<S: Into<String>>(msg: S) -> Self {
        Self::RoutingConflict(msg.into())
    }

    /// Create a new CapacityExceeded error with the provided message
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    /// Create a new InvalidTransition error with the provided message
    pub fn invalid_transition<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a new Unauthorized error with the provided message
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a new Timeout error with the provided message
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new QueueFull error with the provided message
    pub fn queue_full<S: Into<String>>(msg: S) -> Self {
        Self::QueueFull(msg.into())
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may safely retry the operation
    ///
    /// True only for [`Timeout`](ChatEngineError::Timeout): no state was
    /// mutated. A `RoutingConflict` is *not* retryable — the conversation is
    /// gone and retrying would only lose again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<anyhow::Error> for ChatEngineError {
    fn from(err: anyhow::Error) -> Self {
        // Unexpected errors from lower-level components map to Internal.
        Self::Internal(err.to_string())
    }
}

/// Result type for chat engine operations
///
/// Type alias for `std::result::Result<T, ChatEngineError>` used throughout
/// the crate.
pub type Result<T> = std::result::Result<T, ChatEngineError>;
