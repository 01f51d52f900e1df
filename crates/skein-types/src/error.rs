//! Shared error taxonomy for the Skein engine.

use thiserror::Error;

/// Top-level error type for the Skein engine.
///
/// The variants mirror how failures propagate: validation failures are
/// rejected before dispatch, transition misses never mutate a record,
/// storage failures leave the transition uncommitted, and transport
/// failures are retried by the outbound queue before surfacing.
#[derive(Error, Debug)]
pub enum SkeinError {
    /// Malformed message body, rejected before it reaches a state machine.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The incoming message kind has no edge from the record's current
    /// state. Also covers an ack or problem report arriving for a thread
    /// with no existing record (`state` is then `"none"`).
    #[error("No transition from state '{state}' on '{trigger}' (thread {thread_id})")]
    StateTransition {
        /// Thread the offending message was correlated to.
        thread_id: String,
        /// State the record was in, or `"none"` if no record exists.
        state: String,
        /// The message kind that had no edge.
        trigger: String,
    },

    /// A peer signalled a protocol-level failure. Terminal for the exchange.
    #[error("Problem report on thread '{thread_id}': {code}: {description}")]
    ProblemReport {
        /// Thread the report was correlated to.
        thread_id: String,
        /// Machine-readable problem code.
        code: String,
        /// Human-readable description.
        description: String,
    },

    /// Persistence failure. The transition is not considered committed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record with this id already exists in the store.
    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    /// Envelope pack/unpack or transport send failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A handler is already bound to this message type URI.
    #[error("Handler already registered for '{0}'")]
    DuplicateHandler(String),

    /// The requested record does not exist.
    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

impl SkeinError {
    /// Build the transition error for a message arriving on a thread that
    /// has no record. Nothing is created for such messages.
    pub fn no_record(thread_id: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self::StateTransition {
            thread_id: thread_id.into(),
            state: "none".to_string(),
            trigger: trigger.into(),
        }
    }

    /// Whether this error is a transition-table miss (including the
    /// no-record case).
    pub fn is_state_transition(&self) -> bool {
        matches!(self, Self::StateTransition { .. })
    }
}

impl From<serde_json::Error> for SkeinError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Alias for results with [`SkeinError`].
pub type SkeinResult<T> = Result<T, SkeinError>;
