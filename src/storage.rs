//! On-disk directory layout for the event log, snapshots, and projection
//! checkpoints.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Manages the on-disk directory layout of a store.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     LOCK                        -- held by the open FileBackend
///     log.jsonl                   -- global event log (FileBackend)
///     snapshots/
///         <aggregate_type>/
///             <instance_id>/
///                 snapshot.json
///     projections/
///         <projection_name>/
///             checkpoint.json
/// ```
///
/// `StoreLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; [`ensure`](Self::ensure)
    /// creates it.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/log.jsonl`
    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join("log.jsonl")
    }

    /// `<base_dir>/LOCK`
    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("LOCK")
    }

    /// `<base_dir>/snapshots/<aggregate_type>/<instance_id>/snapshot.json`
    pub fn snapshot_path(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(aggregate_type)
            .join(instance_id)
            .join("snapshot.json")
    }

    /// `<base_dir>/projections`
    pub fn projections_dir(&self) -> PathBuf {
        self.base_dir.join("projections")
    }

    /// `<base_dir>/projections/<name>`
    pub fn projection_dir(&self, name: &str) -> PathBuf {
        self.projections_dir().join(name)
    }

    /// `<base_dir>/projections/<name>/checkpoint.json`
    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.projection_dir(name).join("checkpoint.json")
    }

    /// Create the base directory if it does not exist. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directory creation fails.
    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_dir)
    }
}

/// Serialize `value` to `path`, replacing any previous file.
///
/// The bytes go to a uniquely named sibling first and are renamed into
/// place, so concurrent readers see either the old file or the new one.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec(value).map_err(io::Error::other)?;
    let staging = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    if let Err(e) = fs::write(&staging, &json).and_then(|()| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    Ok(())
}

/// Read a JSON file written by [`write_json_atomic`].
///
/// A missing file is `Ok(None)`. So is one that does not parse: the files
/// read this way are caches, and a warning naming `what` is logged.
///
/// # Errors
///
/// Returns `io::Error` for read failures other than a missing file.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable {what}, ignoring");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn path_helpers_correct() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StoreLayout::new(tmp.path());

        assert_eq!(layout.base_dir(), tmp.path());
        assert_eq!(layout.log_path(), tmp.path().join("log.jsonl"));
        assert_eq!(layout.lock_path(), tmp.path().join("LOCK"));
        assert_eq!(
            layout.snapshot_path("card", "abc-123"),
            tmp.path().join("snapshots/card/abc-123/snapshot.json")
        );
        assert_eq!(layout.projections_dir(), tmp.path().join("projections"));
        assert_eq!(
            layout.projection_dir("card-catalog"),
            tmp.path().join("projections/card-catalog")
        );
        assert_eq!(
            layout.checkpoint_path("card-catalog"),
            tmp.path().join("projections/card-catalog/checkpoint.json")
        );
    }

    #[test]
    fn json_files_replace_atomically() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/value.json");

        write_json_atomic(&path, &vec![1, 2]).unwrap();
        write_json_atomic(&path, &vec![3]).unwrap();

        assert_eq!(read_json::<Vec<u32>>(&path, "value").unwrap(), Some(vec![3]));
        let siblings = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1, "no staging files should be left behind");
    }

    #[test]
    fn missing_and_unparseable_files_read_as_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("value.json");
        assert_eq!(read_json::<u32>(&path, "value").unwrap(), None);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(read_json::<u32>(&path, "value").unwrap(), None);
    }

    #[test]
    fn ensure_creates_nested_base_dir_idempotently() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StoreLayout::new(tmp.path().join("a/b/c"));

        layout.ensure().expect("first ensure should succeed");
        layout.ensure().expect("second ensure should succeed");
        assert!(layout.base_dir().is_dir());
    }
}
