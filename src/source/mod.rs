//! Memoized view of the project's source files.
//!
//! One process-global, read-mostly map keyed by project-relative path.
//! Each entry snapshots mtime, content hash, and parsed blocks together,
//! so a reader always observes a hash and the blocks derived from the
//! same bytes. Entries refresh when mtime moves; a file parses at most
//! once per content hash.

use std::{fs, io, path::PathBuf, sync::Arc, time::UNIX_EPOCH};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    blocks::SourceModule,
    errors::Result,
    hash::ContentHash,
};

/// Everything known about one file at one point in time.
#[derive(Debug)]
pub struct FileSnapshot {
    /// Modification time in float seconds since the epoch.
    pub mtime: f64,
    /// SHA-1 over the file bytes.
    pub content_hash: ContentHash,
    /// Parsed blocks of those same bytes.
    pub module: Arc<SourceModule>,
}

/// Lazy, memoized cache over the source tree rooted at `root`.
/// Concurrent readers are safe; refreshing on a miss is idempotent.
pub struct SourceTree {
    root: PathBuf,
    files: DashMap<String, Arc<FileSnapshot>, ahash::RandomState>,
}

impl SourceTree {
    pub fn new(root: impl Into<PathBuf>) -> SourceTree {
        SourceTree {
            root: root.into(),
            files: DashMap::default(),
        }
    }

    /// Project root this tree resolves relative paths against.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root.join(path).is_file()
    }

    /// Current content hash of `path`, or `None` when the file is gone.
    pub fn content_hash(&self, path: &str) -> Result<Option<ContentHash>> {
        Ok(self.snapshot(path)?.map(|snap| snap.content_hash))
    }

    /// Current parsed blocks of `path`, or `None` when the file is gone.
    pub fn module(&self, path: &str) -> Result<Option<Arc<SourceModule>>> {
        Ok(self.snapshot(path)?.map(|snap| snap.module.clone()))
    }

    /// Refresh many paths at once. Errors on individual files are
    /// deferred to the per-path accessors.
    pub fn warm(&self, paths: &[String]) {
        paths.par_iter().for_each(|path| {
            let _ = self.snapshot(path);
        });
    }

    /// Fetch the snapshot for `path`, refreshing when mtime moved.
    pub fn snapshot(&self, path: &str) -> Result<Option<Arc<FileSnapshot>>> {
        let full = self.root.join(path);
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.files.remove(path);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let mtime = mtime_seconds(&meta);

        let cached = self.files.get(path).map(|entry| entry.value().clone());
        if let Some(snap) = &cached
            && snap.mtime == mtime
        {
            return Ok(Some(snap.clone()));
        }

        let bytes = fs::read(&full)?;
        let content_hash = ContentHash::of(&bytes);
        let module = match cached {
            // mtime moved but bytes did not; keep the parse
            Some(prev) if prev.content_hash == content_hash => prev.module.clone(),
            _ => Arc::new(SourceModule::extract(&String::from_utf8_lossy(&bytes))),
        };
        let snap = Arc::new(FileSnapshot {
            mtime,
            content_hash,
            module,
        });
        self.files.insert(path.to_string(), snap.clone());
        Ok(Some(snap))
    }
}

fn mtime_seconds(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}
