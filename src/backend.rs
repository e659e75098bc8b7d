//! Event backends: the durable log behind every aggregate stream and
//! projection.
//!
//! A backend stores one global, totally ordered log. Each event also
//! belongs to exactly one stream and carries its version within that
//! stream. The only write primitive is a conditional append: the caller
//! states the stream version it decided against, and the backend rejects
//! the append if anyone else got there first.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::event::{ProposedEvent, StoredEvent, StreamKey, now_millis};
use crate::storage::StoreLayout;

/// Boxed future returned by [`EventBackend`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Precondition for a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append unconditionally.
    Any,
    /// The stream must not contain any events yet.
    NoStream,
    /// The stream must contain exactly this many events.
    ///
    /// `Exact(0)` is equivalent to [`NoStream`](Self::NoStream).
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream currently holding `current` events satisfies this
    /// precondition.
    pub fn matches(self, current: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == 0,
            ExpectedVersion::Exact(n) => current == n,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Number of events in the stream after the append.
    pub next_stream_version: u64,
    /// Length of the global log after the append.
    pub next_global_position: u64,
}

/// Errors produced by an [`EventBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The conditional append lost a race with another writer.
    #[error("wrong expected version for {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: StreamKey,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// Reading or writing the log failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An event could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another [`FileBackend`] already holds the log's lock.
    #[error("event log at {} is locked by another writer", path.display())]
    Locked { path: PathBuf },
}

/// Durable storage for the global event log.
///
/// All methods return boxed futures so the trait stays object-safe; the
/// store holds its backend as `Arc<dyn EventBackend>`.
pub trait EventBackend: Send + Sync + 'static {
    /// Atomically append `events` to `stream` if `expected` matches the
    /// stream's current version. Either every event is appended or none is.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::WrongExpectedVersion`] if the precondition
    /// fails, or an I/O or serialization error.
    fn append<'a>(
        &'a self,
        stream: &'a StreamKey,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> BoxFuture<'a, Result<AppendOutcome, BackendError>>;

    /// Read `stream` starting at `from_version` (inclusive).
    fn read_stream<'a>(
        &'a self,
        stream: &'a StreamKey,
        from_version: u64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, BackendError>>;

    /// Read up to `max` events from the global log starting at
    /// `from_position` (inclusive).
    fn read_all(
        &self,
        from_position: u64,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, BackendError>>;
}

// ---------------------------------------------------------------------------
// Shared in-memory log
// ---------------------------------------------------------------------------

/// The global log plus a per-stream index into it.
#[derive(Debug, Default)]
struct LogState {
    events: Vec<StoredEvent>,
    streams: HashMap<StreamKey, Vec<usize>>,
}

impl LogState {
    fn version(&self, stream: &StreamKey) -> u64 {
        self.streams.get(stream).map_or(0, |idx| idx.len() as u64)
    }

    /// Check `expected` and assign positions, without mutating the log.
    fn stage(
        &self,
        stream: &StreamKey,
        expected: ExpectedVersion,
        proposed: Vec<ProposedEvent>,
    ) -> Result<Vec<StoredEvent>, BackendError> {
        let actual = self.version(stream);
        if !expected.matches(actual) {
            return Err(BackendError::WrongExpectedVersion {
                stream: stream.clone(),
                expected,
                actual,
            });
        }

        let recorded_at = now_millis();
        let base = self.events.len() as u64;
        Ok(proposed
            .into_iter()
            .enumerate()
            .map(|(i, p)| StoredEvent {
                event_id: p.event_id,
                aggregate_type: stream.aggregate_type.clone(),
                instance_id: stream.instance_id.clone(),
                stream_version: actual + i as u64,
                global_position: base + i as u64,
                event_type: p.event_type,
                payload: p.payload,
                metadata: p.metadata,
                recorded_at,
            })
            .collect())
    }

    fn commit(&mut self, stream: &StreamKey, records: Vec<StoredEvent>) -> AppendOutcome {
        for record in records {
            self.push(record);
        }
        AppendOutcome {
            next_stream_version: self.version(stream),
            next_global_position: self.events.len() as u64,
        }
    }

    fn push(&mut self, record: StoredEvent) {
        let idx = self.events.len();
        self.streams
            .entry(record.stream_key())
            .or_default()
            .push(idx);
        self.events.push(record);
    }

    /// Re-insert a persisted record, checking that its positions line up.
    fn restore(&mut self, record: StoredEvent) -> Result<(), BackendError> {
        let expected_global = self.events.len() as u64;
        let expected_stream = self.version(&record.stream_key());
        if record.global_position != expected_global || record.stream_version != expected_stream {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "log out of order at {}: expected global {expected_global} / stream {expected_stream}, found {} / {}",
                    record.stream_key(),
                    record.global_position,
                    record.stream_version
                ),
            )));
        }
        self.push(record);
        Ok(())
    }

    fn read_stream(&self, stream: &StreamKey, from_version: u64) -> Vec<StoredEvent> {
        self.streams
            .get(stream)
            .map(|idx| {
                idx.iter()
                    .skip(from_version as usize)
                    .map(|&i| self.events[i].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read_all(&self, from_position: u64, max: usize) -> Vec<StoredEvent> {
        self.events
            .iter()
            .skip(from_position as usize)
            .take(max)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// A process-local backend. Everything is lost when it is dropped.
///
/// Share one instance between several stores (via `Arc`) to model
/// independent processes writing to the same log.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    log: Mutex<LogState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBackend for MemoryBackend {
    fn append<'a>(
        &'a self,
        stream: &'a StreamKey,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> BoxFuture<'a, Result<AppendOutcome, BackendError>> {
        Box::pin(async move {
            let mut log = self.log.lock().await;
            let records = log.stage(stream, expected, events)?;
            Ok(log.commit(stream, records))
        })
    }

    fn read_stream<'a>(
        &'a self,
        stream: &'a StreamKey,
        from_version: u64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, BackendError>> {
        Box::pin(async move { Ok(self.log.lock().await.read_stream(stream, from_version)) })
    }

    fn read_all(
        &self,
        from_position: u64,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, BackendError>> {
        Box::pin(async move { Ok(self.log.lock().await.read_all(from_position, max)) })
    }
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

/// A backend persisted as one JSON object per line in `log.jsonl`.
///
/// The whole log is replayed into memory on [`open`](Self::open). Appends
/// are written, flushed, and synced before they become visible to readers,
/// so a crash never exposes an event that is not on disk.
///
/// The in-memory copy is authoritative, so a data directory has exactly one
/// writer: `open` takes an exclusive lock on [`StoreLayout::lock_path`] and
/// holds it until the backend is dropped. Replicas that need to share a log
/// must share one backend instance.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileLog>,
    /// Released on drop.
    _lock: std::fs::File,
}

#[derive(Debug)]
struct FileLog {
    log: LogState,
    file: tokio::fs::File,
    /// Length of the committed prefix of the file.
    len: u64,
}

impl FileLog {
    async fn write_durably(&mut self, buf: &[u8]) -> io::Result<()> {
        let written = async {
            self.file.write_all(buf).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        match written {
            Ok(()) => {
                self.len += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Drop any partial line so the next append starts clean.
                if let Err(trunc) = self.file.set_len(self.len).await {
                    tracing::error!(error = %trunc, "failed to roll back partial append");
                }
                Err(e)
            }
        }
    }
}

impl FileBackend {
    /// Open (or create) the log at [`StoreLayout::log_path`].
    ///
    /// A trailing line that is incomplete or unparseable is treated as a
    /// torn write from a crash: it is logged and truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Locked`] if another backend has the log
    /// open, or another [`BackendError`] if the file cannot be read or a
    /// line other than the last one is corrupt.
    pub async fn open(layout: &StoreLayout) -> Result<Self, BackendError> {
        layout.ensure()?;
        let lock = lock_exclusive(&layout.lock_path())?;
        let path = layout.log_path();

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (log, valid_len) = replay_log(&bytes)?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if valid_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = bytes.len() as u64 - valid_len,
                "truncating torn tail of event log"
            );
            file.set_len(valid_len).await?;
        }

        tracing::debug!(
            path = %path.display(),
            events = log.events.len(),
            "event log opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(FileLog {
                log,
                file,
                len: valid_len,
            }),
            _lock: lock,
        })
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the single-writer lock for a data directory without blocking.
fn lock_exclusive(path: &Path) -> Result<std::fs::File, BackendError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            tracing::warn!(path = %path.display(), "event log already locked");
            Err(BackendError::Locked {
                path: path.to_owned(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Rebuild the log from file contents. Returns the log and the length of
/// the prefix that parsed cleanly.
fn replay_log(bytes: &[u8]) -> Result<(LogState, u64), BackendError> {
    let mut log = LogState::default();
    let mut offset = 0usize;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        let Some(body) = line.strip_suffix(b"\n") else {
            break;
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            offset += line.len();
            continue;
        }
        match serde_json::from_slice::<StoredEvent>(body) {
            Ok(record) => log.restore(record)?,
            Err(_) if offset + line.len() == bytes.len() => break,
            Err(e) => return Err(e.into()),
        }
        offset += line.len();
    }

    Ok((log, offset as u64))
}

impl EventBackend for FileBackend {
    fn append<'a>(
        &'a self,
        stream: &'a StreamKey,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> BoxFuture<'a, Result<AppendOutcome, BackendError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let records = inner.log.stage(stream, expected, events)?;
            if !records.is_empty() {
                let mut buf = Vec::new();
                for record in &records {
                    serde_json::to_writer(&mut buf, record)?;
                    buf.push(b'\n');
                }
                inner.write_durably(&buf).await?;
            }
            Ok(inner.log.commit(stream, records))
        })
    }

    fn read_stream<'a>(
        &'a self,
        stream: &'a StreamKey,
        from_version: u64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, BackendError>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .log
                .read_stream(stream, from_version))
        })
    }

    fn read_all(
        &self,
        from_position: u64,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, BackendError>> {
        Box::pin(async move { Ok(self.inner.lock().await.log.read_all(from_position, max)) })
    }
}
