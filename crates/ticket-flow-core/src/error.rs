use thiserror::Error;

use crate::models::Phase;

/// Failure to apply a conversation transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The event is not valid in the current phase; surfaced to the user
    /// as a soft no-op.
    #[error("transition '{transition}' is not valid in phase {phase}")]
    InvalidTransition {
        phase: Phase,
        transition: &'static str,
    },
    /// Someone else advanced the conversation first; re-read and retry,
    /// or drop the event.
    #[error("stale version for {key}: expected {expected}, found {actual}")]
    StaleVersion {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("no active conversation for {0}")]
    NotFound(String),
    #[error("conversation storage error: {0}")]
    Storage(String),
}

/// Failure of a duplicate detection request.
///
/// Both variants degrade to an empty, flagged candidate list; neither may
/// be reported as "no duplicates".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("duplicate detection unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate detection timed out after {0} ms")]
    Timeout(u64),
}

/// Failure reported by an embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    /// Provider down, rate limited, or unreachable; worth retrying later.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    /// The provider refused this input; retrying the same text will not help.
    #[error("embedding rejected: {0}")]
    Rejected(String),
}
