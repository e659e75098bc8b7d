//! Crate-level error types for command execution, state retrieval,
//! projections, and the service layer.

use crate::backend::BackendError;
use crate::card::CardError;
use crate::ids::ValidationError;

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g. "card not found").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt found that another writer had advanced the stream
    /// between the read and the conditional append.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// The event backend failed to read or persist events.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The actor task exited unexpectedly.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The event backend failed while catching up.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The actor task exited unexpectedly.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading a projection fails.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// No projection with this name was registered on the store builder.
    #[error("projection '{0}' not registered")]
    NotRegistered(&'static str),

    /// Reading the global log failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Persisting the checkpoint failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A projection was registered under a name another type also uses.
    #[error("projection '{0}' type mismatch")]
    TypeMismatch(&'static str),
}

/// Outcome classes surfaced to API callers.
///
/// Each variant maps to one HTTP status and error code, so a client can
/// always tell an expired session apart from a missing card.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The card does not exist or has been deleted.
    #[error("card not found")]
    NotFound,
    /// No valid credential was presented.
    #[error("authentication required")]
    Unauthorized,
    /// The credential is valid but lacks permission.
    #[error("{0}")]
    Forbidden(String),
    /// Concurrent modification could not be resolved within the retry budget.
    #[error("concurrent modification, please retry")]
    Conflict,
    /// Input failed validation.
    #[error("{0}")]
    Validation(String),
    /// Storage or runtime failure.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<CardError> for ServiceError {
    fn from(err: CardError) -> Self {
        match err {
            CardError::NotFound => ServiceError::NotFound,
            CardError::AlreadyExists => ServiceError::Conflict,
            CardError::Forbidden => ServiceError::Forbidden(err.to_string()),
            CardError::Invalid(msg) => ServiceError::Validation(msg),
        }
    }
}

impl From<ExecuteError<CardError>> for ServiceError {
    fn from(err: ExecuteError<CardError>) -> Self {
        match err {
            ExecuteError::Domain(e) => e.into(),
            ExecuteError::Conflict => ServiceError::Conflict,
            ExecuteError::Backend(e) => ServiceError::Unavailable(e.to_string()),
            ExecuteError::ActorGone => ServiceError::Unavailable(err.to_string()),
        }
    }
}

impl From<StateError> for ServiceError {
    fn from(err: StateError) -> Self {
        ServiceError::Unavailable(err.to_string())
    }
}

impl From<BackendError> for ServiceError {
    fn from(err: BackendError) -> Self {
        ServiceError::Unavailable(err.to_string())
    }
}

impl From<ProjectionError> for ServiceError {
    fn from(err: ProjectionError) -> Self {
        ServiceError::Unavailable(err.to_string())
    }
}
