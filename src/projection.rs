//! Cross-stream projections (read models) backed by the global event log.
//!
//! Each projection keeps a single global cursor. Catch-up pages through
//! the backend's global log from that cursor, applies every event, and
//! persists the checkpoint when the store has a base directory.

use std::any::Any;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{BoxFuture, EventBackend};
use crate::error::ProjectionError;
use crate::event::StoredEvent;
use crate::storage::{read_json, write_json_atomic};

/// Events fetched per `read_all` call during catch-up.
const CATCH_UP_BATCH: usize = 256;

/// A read model folded from the global log across every stream.
///
/// The state is rebuilt by replaying the log from position zero, so it
/// must be a pure function of the events seen: `apply` may not consult
/// clocks, I/O, or anything else outside the event. Events of other
/// aggregate types or unknown event types are skipped inside `apply`.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registry key and checkpoint directory name.
    const NAME: &'static str;

    fn apply(&mut self, event: &StoredEvent);
}

/// Projection state together with its cursor into the global log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ProjectionCheckpoint<P> {
    pub state: P,
    /// First global position not yet applied.
    pub next_position: u64,
}

/// Drives one projection's catch-up against the backend's global log.
pub(crate) struct ProjectionRunner<P: Projection> {
    checkpoint: ProjectionCheckpoint<P>,
    backend: Arc<dyn EventBackend>,
    /// `None` keeps the checkpoint in memory only.
    checkpoint_path: Option<PathBuf>,
}

impl<P: Projection> ProjectionRunner<P> {
    /// Create a runner, resuming from the checkpoint at `checkpoint_path`
    /// when one is readable and starting from position zero otherwise.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if an existing checkpoint cannot be read.
    pub(crate) fn new(
        backend: Arc<dyn EventBackend>,
        checkpoint_path: Option<PathBuf>,
    ) -> io::Result<Self> {
        let checkpoint = match &checkpoint_path {
            Some(path) => read_json::<ProjectionCheckpoint<P>>(path, "projection checkpoint")?
                .unwrap_or_default(),
            None => ProjectionCheckpoint::default(),
        };
        Ok(Self {
            checkpoint,
            backend,
            checkpoint_path,
        })
    }

    /// Read and apply everything past the cursor, then persist the
    /// checkpoint if anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if reading the log or saving the
    /// checkpoint fails.
    pub(crate) async fn catch_up(&mut self) -> Result<(), ProjectionError> {
        let start = self.checkpoint.next_position;
        loop {
            let batch = self
                .backend
                .read_all(self.checkpoint.next_position, CATCH_UP_BATCH)
                .await?;
            for event in &batch {
                apply_stored_event(
                    &mut self.checkpoint.state,
                    &mut self.checkpoint.next_position,
                    event,
                );
            }
            if batch.len() < CATCH_UP_BATCH {
                break;
            }
        }

        let end = self.checkpoint.next_position;
        if end == start {
            return Ok(());
        }
        tracing::debug!(projection = P::NAME, from = start, to = end, "projection caught up");
        if let Some(path) = &self.checkpoint_path {
            write_json_atomic(path, &self.checkpoint)?;
        }
        Ok(())
    }
}

/// Apply one event and advance the cursor past it. Events below the
/// cursor were already applied and are skipped.
fn apply_stored_event<P: Projection>(state: &mut P, next_position: &mut u64, event: &StoredEvent) {
    if event.global_position < *next_position {
        return;
    }
    state.apply(event);
    *next_position = event.global_position + 1;
}

/// Object-safe view of a [`ProjectionRunner`], letting the store keep
/// runners of different projection types in one map.
pub(crate) trait ProjectionCatchUp: Send + Sync {
    fn catch_up(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>>;

    fn position(&self) -> u64;

    /// The current state, for the caller to downcast.
    fn state_ref(&self) -> &(dyn Any + Send + Sync);
}

impl<P: Projection> ProjectionCatchUp for ProjectionRunner<P> {
    fn catch_up(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>> {
        Box::pin(ProjectionRunner::catch_up(self))
    }

    fn position(&self) -> u64 {
        self.checkpoint.next_position
    }

    fn state_ref(&self) -> &(dyn Any + Send + Sync) {
        &self.checkpoint.state
    }
}
