//! Per-aggregate state snapshots kept next to the event log.
//!
//! A snapshot lets a respawned actor skip replaying its whole stream. It is
//! only ever a cache: a missing, unreadable, or inconsistent snapshot means
//! replaying from the start, never an error surfaced to callers.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;
use crate::event::now_millis;
use crate::storage::{StoreLayout, read_json, write_json_atomic};

/// Folded aggregate state plus the stream version it reflects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    pub aggregate_type: String,
    pub state: A,
    /// Events folded into `state`; catch-up resumes reading here.
    pub stream_version: u64,
    /// Unix epoch milliseconds.
    pub taken_at: u64,
}

impl<A: Aggregate> Snapshot<A> {
    pub fn new(state: A, stream_version: u64) -> Self {
        Self {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            state,
            stream_version,
            taken_at: now_millis(),
        }
    }
}

/// Write `snapshot` for `instance_id`, replacing any previous one.
///
/// # Errors
///
/// Returns `io::Error` if the snapshot cannot be written.
pub fn save_snapshot<A: Aggregate>(
    layout: &StoreLayout,
    instance_id: &str,
    snapshot: &Snapshot<A>,
) -> io::Result<()> {
    write_json_atomic(
        &layout.snapshot_path(A::AGGREGATE_TYPE, instance_id),
        snapshot,
    )
}

/// Read the snapshot for `instance_id`, if a usable one exists.
///
/// Unparseable snapshots, snapshots of another aggregate type, and states
/// that fail [`Aggregate::verify`] are logged and reported as `None`.
///
/// # Errors
///
/// Returns `io::Error` for read failures other than a missing file.
pub fn load_snapshot<A: Aggregate>(
    layout: &StoreLayout,
    instance_id: &str,
) -> io::Result<Option<Snapshot<A>>> {
    let path = layout.snapshot_path(A::AGGREGATE_TYPE, instance_id);
    let Some(snap) = read_json::<Snapshot<A>>(&path, "snapshot")? else {
        return Ok(None);
    };
    let problem = if snap.aggregate_type != A::AGGREGATE_TYPE {
        "aggregate type mismatch"
    } else if !snap.state.verify() {
        "state failed verification"
    } else {
        return Ok(Some(snap));
    };
    tracing::warn!(path = %path.display(), problem, "ignoring unusable snapshot");
    Ok(None)
}
