//! Actor loop that owns an aggregate instance and processes its commands.
//!
//! Each actor runs as a tokio task and handles messages from an `mpsc`
//! channel one at a time, so commands against one instance never interleave
//! inside a process. Writers in other processes (or other stores sharing a
//! backend) are handled with optimistic concurrency: every append is
//! conditional on the stream version the decision was made against, and a
//! lost race triggers catch-up, a fresh decision, and a bounded retry.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle),
//! [`CommandOutcome`], and [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::aggregate::{Aggregate, replay};
use crate::backend::{BackendError, EventBackend, ExpectedVersion};
use crate::command::CommandContext;
use crate::error::{ExecuteError, StateError};
use crate::event::{StreamKey, encode_domain_event};
use crate::snapshot::{Snapshot, load_snapshot, save_snapshot};
use crate::storage::StoreLayout;

/// Exponential backoff applied when a conditional append loses a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` fails on the first conflict.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Configuration for the actor loop.
///
/// Internal to the crate; callers configure these through
/// [`AggregateStoreBuilder`](crate::AggregateStoreBuilder).
#[derive(Debug, Clone)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
    /// Where snapshots live. `None` disables snapshotting.
    pub layout: Option<StoreLayout>,
}

/// What a successful command produced.
#[derive(Debug, Clone)]
pub struct CommandOutcome<A: Aggregate> {
    /// Aggregate state after the produced events were applied.
    pub state: A,
    /// Events appended by this command (empty for a no-op).
    pub events: Vec<A::DomainEvent>,
    /// Stream version after the append.
    pub version: u64,
}

type ExecuteResult<A> = Result<CommandOutcome<A>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from [`AggregateHandle`] to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },
    /// Snapshot and stop. The reply fires once the snapshot is written.
    Shutdown { reply: oneshot::Sender<()> },
}

/// The actor's owned state: the folded aggregate and how far into the
/// stream it has read.
struct AggregateActor<A: Aggregate> {
    instance_id: String,
    stream: StreamKey,
    state: A,
    version: u64,
    backend: Arc<dyn EventBackend>,
}

impl<A: Aggregate> AggregateActor<A> {
    /// Fold any events appended since `version`, by this actor or anyone else.
    async fn catch_up(&mut self) -> Result<(), BackendError> {
        let events = self.backend.read_stream(&self.stream, self.version).await?;
        if events.is_empty() {
            return Ok(());
        }
        let state = std::mem::take(&mut self.state);
        let (state, version) = replay(state, self.version, &events);
        tracing::debug!(from = self.version, to = version, "caught up");
        self.state = state;
        self.version = version;
        Ok(())
    }

    /// Catch up, decide, and append conditionally, retrying lost races.
    async fn execute(
        &mut self,
        cmd: A::Command,
        ctx: &CommandContext,
        retry: RetryPolicy,
    ) -> ExecuteResult<A> {
        self.catch_up().await?;

        let mut attempt = 0;
        loop {
            let events = self.state.handle(cmd.clone()).map_err(ExecuteError::Domain)?;
            if events.is_empty() {
                return Ok(self.outcome(events));
            }

            let proposed = events
                .iter()
                .map(|e| encode_domain_event::<A>(e, ctx, &self.instance_id))
                .collect::<Result<Vec<_>, _>>()
                .map_err(BackendError::from)?;

            match self
                .backend
                .append(&self.stream, ExpectedVersion::Exact(self.version), proposed)
                .await
            {
                Ok(appended) => {
                    let state = std::mem::take(&mut self.state);
                    self.state = events.iter().fold(state, |s, e| s.apply(e));
                    self.version = appended.next_stream_version;
                    tracing::info!(
                        count = events.len(),
                        version = self.version,
                        "events appended"
                    );
                    return Ok(self.outcome(events));
                }
                Err(BackendError::WrongExpectedVersion { actual, .. }) => {
                    if attempt >= retry.max_retries {
                        tracing::warn!(attempts = attempt + 1, "retries exhausted");
                        return Err(ExecuteError::Conflict);
                    }
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        expected = self.version,
                        actual,
                        delay_ms = delay.as_millis() as u64,
                        "append conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    self.catch_up().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn outcome(&self, events: Vec<A::DomainEvent>) -> CommandOutcome<A> {
        CommandOutcome {
            state: self.state.clone(),
            events,
            version: self.version,
        }
    }

    fn save_snapshot(&self, layout: &StoreLayout) {
        if self.version == 0 {
            return;
        }
        let snapshot = Snapshot::new(self.state.clone(), self.version);
        match save_snapshot::<A>(layout, &self.instance_id, &snapshot) {
            Ok(()) => tracing::debug!(version = self.version, "snapshot saved"),
            Err(e) => tracing::warn!(error = %e, "failed to save snapshot"),
        }
    }
}

/// Runs the actor loop until the channel closes, a `Shutdown` arrives, or
/// the idle timeout elapses. A snapshot is saved on every exit path.
async fn run_actor<A: Aggregate>(
    mut actor: AggregateActor<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    config: ActorConfig,
) {
    let mut shutdown_reply = None;
    loop {
        match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %actor.instance_id,
                    correlation_id = ctx.correlation_id.as_deref().unwrap_or(""),
                );
                let result = actor.execute(cmd, &ctx, config.retry).instrument(span).await;
                // A dropped receiver means the caller stopped waiting.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::GetState { reply })) => {
                let result = actor
                    .catch_up()
                    .await
                    .map(|()| actor.state.clone())
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::Shutdown { reply })) => {
                shutdown_reply = Some(reply);
                break;
            }
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %actor.instance_id,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }

    // Stop accepting messages before the snapshot so `is_alive` turns false
    // and the store respawns from the snapshot we are about to write.
    rx.close();
    if let Some(layout) = &config.layout {
        actor.save_snapshot(layout);
    }
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

// Manual `Clone`: only the sender is cloned, whatever `A` is.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for ActorMessage<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActorMessage::Execute { .. } => "Execute",
            ActorMessage::GetState { .. } => "GetState",
            ActorMessage::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Conflict`] -- retries exhausted against concurrent writers.
    /// * [`ExecuteError::Backend`] -- the backend failed.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read the current aggregate state, catching up from the backend first.
    ///
    /// # Errors
    ///
    /// * [`StateError::Backend`] -- the backend failed.
    /// * [`StateError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Ask the actor to snapshot and stop, waiting until it has.
    ///
    /// A no-op if the actor already exited.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ActorMessage::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Whether the actor backing this handle is still running.
    ///
    /// The store uses this to evict stale handles from its cache and
    /// re-spawn the actor on the next `get` call.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn an actor for `instance_id`: restore from snapshot if one is
/// available and consistent, catch up on newer events, then start the loop.
///
/// # Errors
///
/// Returns [`BackendError`] if the snapshot cannot be read or catch-up fails.
pub(crate) async fn spawn_actor<A: Aggregate>(
    instance_id: &str,
    backend: Arc<dyn EventBackend>,
    config: ActorConfig,
) -> Result<AggregateHandle<A>, BackendError> {
    let snapshot = match &config.layout {
        Some(layout) => load_snapshot::<A>(layout, instance_id)?,
        None => None,
    };
    let (state, version) = snapshot.map_or_else(
        || (A::default(), 0),
        |snap| (snap.state, snap.stream_version),
    );

    let mut actor = AggregateActor {
        instance_id: instance_id.to_owned(),
        stream: StreamKey::of::<A>(instance_id),
        state,
        version,
        backend,
    };
    actor.catch_up().await?;

    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(32);
    tokio::spawn(run_actor(actor, rx, config));
    Ok(AggregateHandle { sender: tx })
}
