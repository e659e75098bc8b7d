//! Top-level entry point that composes actor spawning, handle caching, and
//! projections into a single [`AggregateStore`] type.
//!
//! The store is opened via [`AggregateStoreBuilder`], which takes the event
//! backend and optionally a local directory for snapshots and projection
//! checkpoints.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{ActorConfig, AggregateHandle, RetryPolicy, spawn_actor};
use crate::aggregate::Aggregate;
use crate::backend::{BackendError, BoxFuture, EventBackend};
use crate::error::ProjectionError;
use crate::projection::{Projection, ProjectionCatchUp, ProjectionRunner};
use crate::storage::StoreLayout;

/// Default idle timeout for actors: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A cached actor handle with its aggregate type erased.
trait CachedHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn is_alive(&self) -> bool;
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

impl<A: Aggregate> CachedHandle for AggregateHandle<A> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_alive(&self) -> bool {
        AggregateHandle::is_alive(self)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(AggregateHandle::shutdown(self))
    }
}

/// Handle cache keyed by `(TypeId, instance_id)`.
///
/// `TypeId` identifies the aggregate type at runtime; downcasting through
/// [`CachedHandle::as_any`] recovers the typed handle.
type HandleCache = HashMap<(TypeId, String), Box<dyn CachedHandle>>;

/// Projection runners keyed by projection name. `tokio::sync::Mutex`
/// because `catch_up` is async.
type ProjectionMap = HashMap<String, tokio::sync::Mutex<Box<dyn ProjectionCatchUp>>>;

/// Central registry that manages aggregate instance lifecycles.
///
/// `Clone` is cheap; all internal state is `Arc`-wrapped. Several stores
/// may share one backend; they coordinate only through its conditional
/// appends.
#[derive(Clone)]
pub struct AggregateStore {
    backend: Arc<dyn EventBackend>,
    layout: Option<StoreLayout>,
    cache: Arc<RwLock<HandleCache>>,
    projections: Arc<ProjectionMap>,
    idle_timeout: Duration,
    retry: RetryPolicy,
}

// Manual `Debug`: the cache holds trait objects.
impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("layout", &self.layout)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AggregateStore {
    /// Start configuring a store over `backend`.
    pub fn builder(backend: Arc<dyn EventBackend>) -> AggregateStoreBuilder {
        AggregateStoreBuilder::new(backend)
    }

    /// Get a handle to an aggregate instance, spawning its actor if needed.
    ///
    /// At most one live actor exists per instance in this store: the cache
    /// is re-checked under the write lock before spawning. Handles of actors
    /// that have exited are dropped from the cache at the same point.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the actor's initial catch-up fails.
    pub async fn get<A: Aggregate>(&self, id: &str) -> Result<AggregateHandle<A>, BackendError> {
        let key = (TypeId::of::<A>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<A>(&cache, &key) {
                return Ok(handle);
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(handle) = live_handle::<A>(&cache, &key) {
            return Ok(handle);
        }
        let before = cache.len();
        cache.retain(|_, h| h.is_alive());
        if cache.len() < before {
            tracing::trace!(evicted = before - cache.len(), "pruned exited actors");
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %id,
            "spawning actor"
        );
        let config = ActorConfig {
            idle_timeout: self.idle_timeout,
            retry: self.retry,
            layout: self.layout.clone(),
        };
        let handle = spawn_actor::<A>(id, Arc::clone(&self.backend), config).await?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Catch up and return a clone of a registered projection's state.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotRegistered`] if `P` was not registered
    /// on the builder, or an error from catch-up.
    pub async fn projection<P: Projection>(&self) -> Result<P, ProjectionError> {
        self.with_projection(P::clone).await
    }

    /// Catch up a registered projection and run `read` against its state.
    ///
    /// `read` runs while the projection is locked, so other readers of `P`
    /// wait for it; keep it short and free of I/O.
    ///
    /// # Errors
    ///
    /// Same as [`projection`](Self::projection).
    pub async fn with_projection<P: Projection, R>(
        &self,
        read: impl FnOnce(&P) -> R,
    ) -> Result<R, ProjectionError> {
        let runner_mutex = self
            .projections
            .get(P::NAME)
            .ok_or(ProjectionError::NotRegistered(P::NAME))?;
        let mut runner = runner_mutex.lock().await;
        runner.catch_up().await?;
        tracing::trace!(projection = P::NAME, position = runner.position(), "projection read");
        runner
            .state_ref()
            .downcast_ref::<P>()
            .map(read)
            .ok_or(ProjectionError::TypeMismatch(P::NAME))
    }

    /// The backend this store writes to.
    pub fn backend(&self) -> &Arc<dyn EventBackend> {
        &self.backend
    }

    /// Stop every cached actor, letting each write its snapshot.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.cache.write().await.drain().collect();
        tracing::debug!(actors = handles.len(), "shutting down actors");
        for (_, handle) in handles {
            handle.shutdown().await;
        }
    }
}

fn live_handle<A: Aggregate>(
    cache: &HandleCache,
    key: &(TypeId, String),
) -> Option<AggregateHandle<A>> {
    cache
        .get(key)
        .filter(|h| h.is_alive())
        .and_then(|h| h.as_any().downcast_ref::<AggregateHandle<A>>())
        .cloned()
}

/// Factory for creating a type-erased projection runner once the backend
/// and layout are known.
type ProjectionFactory = Box<
    dyn FnOnce(
        Arc<dyn EventBackend>,
        Option<&StoreLayout>,
    ) -> io::Result<tokio::sync::Mutex<Box<dyn ProjectionCatchUp>>>,
>;

/// Builder for configuring and opening an [`AggregateStore`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use cardfold::{AggregateStore, CardCatalog, MemoryBackend};
///
/// # fn example() -> std::io::Result<()> {
/// let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
///     .base_dir("/tmp/cardfold")
///     .projection::<CardCatalog>()
///     .open()?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateStoreBuilder {
    backend: Arc<dyn EventBackend>,
    base_dir: Option<PathBuf>,
    projection_factories: Vec<(String, ProjectionFactory)>,
    idle_timeout: Duration,
    retry: RetryPolicy,
}

impl AggregateStoreBuilder {
    /// Create a builder over `backend` with default settings and no
    /// local directory.
    pub fn new(backend: Arc<dyn EventBackend>) -> Self {
        Self {
            backend,
            base_dir: None,
            projection_factories: Vec::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the local directory for snapshots and projection checkpoints.
    ///
    /// Without one, snapshots are disabled and projections rebuild from
    /// the log on every start.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Register a projection type to be managed by this store.
    ///
    /// Its checkpoint (if any) is loaded when [`open`](Self::open) is called.
    pub fn projection<P: Projection>(mut self) -> Self {
        self.projection_factories.push((
            P::NAME.to_owned(),
            Box::new(|backend, layout: Option<&StoreLayout>| {
                let path = layout.map(|l| l.checkpoint_path(P::NAME));
                let runner = ProjectionRunner::<P>::new(backend, path)?;
                Ok(tokio::sync::Mutex::new(
                    Box::new(runner) as Box<dyn ProjectionCatchUp>
                ))
            }),
        ));
        self
    }

    /// Set the idle timeout for actor eviction.
    ///
    /// Actors that receive no messages for this duration shut down and
    /// save a snapshot. The next [`get`](AggregateStore::get) transparently
    /// re-spawns the actor from snapshot plus catch-up. Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the backoff used when a conditional append loses a race.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build the store, creating the base directory and loading projection
    /// checkpoints.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the base directory cannot be created or a
    /// checkpoint cannot be read.
    pub fn open(self) -> io::Result<AggregateStore> {
        let layout = self.base_dir.map(StoreLayout::new);
        if let Some(layout) = &layout {
            layout.ensure()?;
        }

        let mut projections = HashMap::new();
        for (name, factory) in self.projection_factories {
            let runner = factory(Arc::clone(&self.backend), layout.as_ref()).inspect_err(|e| {
                tracing::error!(error = %e, projection = %name, "failed to initialize projection");
            })?;
            projections.insert(name, runner);
        }

        Ok(AggregateStore {
            backend: self.backend,
            layout,
            cache: Arc::new(RwLock::new(HashMap::new())),
            projections: Arc::new(projections),
            idle_timeout: self.idle_timeout,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::card::{Card, CardCommand, CardDetails};
    use crate::command::CommandContext;
    use crate::event::StoredEvent;
    use crate::ids::ActorId;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct EventCounter {
        count: u64,
    }

    impl Projection for EventCounter {
        const NAME: &'static str = "event-counter";
        fn apply(&mut self, _event: &StoredEvent) {
            self.count += 1;
        }
    }

    fn memory_store() -> AggregateStore {
        AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .projection::<EventCounter>()
            .open()
            .expect("open should succeed")
    }

    fn create() -> CardCommand {
        CardCommand::Create {
            owner: ActorId::new("owner").unwrap(),
            details: CardDetails::titled("Card"),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn get_twice_returns_the_same_actor() {
        let store = memory_store();
        let h1 = store.get::<Card>("c-1").await.expect("first get");
        h1.execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");

        let h2 = store.get::<Card>("c-1").await.expect("second get");
        assert!(h2.is_alive());
        assert_eq!(store.cache.read().await.len(), 1);
        assert!(h2.state().await.unwrap().is_live());
    }

    #[tokio::test]
    async fn concurrent_gets_spawn_one_actor() {
        let store = memory_store();
        let gets = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get::<Card>("c-1").await.map(|_| ()) })
        });
        for task in gets {
            task.await.unwrap().expect("get should succeed");
        }
        assert_eq!(store.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn dead_handle_is_respawned() {
        let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .idle_timeout(Duration::from_millis(50))
            .open()
            .unwrap();
        let h1 = store.get::<Card>("c-1").await.unwrap();
        h1.execute(create(), CommandContext::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h1.is_alive());

        let h2 = store.get::<Card>("c-1").await.unwrap();
        assert!(h2.is_alive());
        assert!(h2.state().await.unwrap().is_live(), "state rebuilt from log");
    }

    #[tokio::test]
    async fn projection_catches_up_on_read() {
        let store = memory_store();
        store
            .get::<Card>("c-1")
            .await
            .unwrap()
            .execute(create(), CommandContext::default())
            .await
            .unwrap();

        let counter = store.projection::<EventCounter>().await.unwrap();
        assert_eq!(counter.count, 1);

        store
            .get::<Card>("c-1")
            .await
            .unwrap()
            .execute(
                CardCommand::Toggle {
                    relation: crate::endorsement::Relation::Like,
                    actor: ActorId::new("fan").unwrap(),
                },
                CommandContext::default(),
            )
            .await
            .unwrap();
        let count = store
            .with_projection(|c: &EventCounter| c.count)
            .await
            .unwrap();
        assert_eq!(count, 2, "borrowed read sees the caught-up state");
    }

    #[tokio::test]
    async fn unregistered_projection_is_an_error() {
        let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .open()
            .unwrap();
        let err = store
            .projection::<EventCounter>()
            .await
            .expect_err("projection was never registered");
        assert!(matches!(err, ProjectionError::NotRegistered("event-counter")));
    }

    #[tokio::test]
    async fn shutdown_snapshots_and_empties_cache() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .base_dir(tmp.path())
            .open()
            .unwrap();
        let handle = store.get::<Card>("c-1").await.unwrap();
        handle
            .execute(create(), CommandContext::default())
            .await
            .unwrap();

        store.shutdown().await;
        assert!(!handle.is_alive());
        assert!(store.cache.read().await.is_empty());
        assert!(
            StoreLayout::new(tmp.path())
                .snapshot_path("card", "c-1")
                .exists()
        );
    }

    #[tokio::test]
    async fn exited_actors_do_not_accumulate_in_the_cache() {
        let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .idle_timeout(Duration::from_millis(30))
            .open()
            .unwrap();
        for i in 0..50 {
            let card = store.get::<Card>(&format!("missing{i}")).await.unwrap();
            assert!(!card.state().await.unwrap().is_live());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        store.get::<Card>("fresh").await.unwrap();

        let cache = store.cache.read().await;
        assert_eq!(cache.len(), 1);
        assert!(cache.values().all(|h| h.is_alive()));
    }
}
