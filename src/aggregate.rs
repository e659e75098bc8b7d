//! Aggregate trait and event replay.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{StoredEvent, decode_domain_event};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more events. It may be called more than once for the
///   same command when an optimistic append has to be retried.
/// - [`apply`](Aggregate::apply) must be a pure, total function.
/// - `DomainEvent` must use `#[serde(tag = "type", content = "data")]`.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. `"card"`). Used in stream keys
    /// and as a directory name for snapshots.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Clone + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Check derived fields against the state they summarize.
    ///
    /// Called on state restored from a snapshot; returning `false` discards
    /// the snapshot and forces a full replay.
    fn verify(&self) -> bool {
        true
    }
}

/// Fold stored events into `state`, starting from stream version `version`.
///
/// Events of unknown type are skipped but still advance the version, so
/// the returned version is always one past the last event seen.
pub(crate) fn replay<A: Aggregate>(mut state: A, mut version: u64, events: &[StoredEvent]) -> (A, u64) {
    for stored in events {
        if let Some(event) = decode_domain_event::<A>(stored) {
            state = state.apply(&event);
        } else {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                event_type = %stored.event_type,
                "skipping unknown event"
            );
        }
        version = stored.stream_version + 1;
    }
    (state, version)
}
