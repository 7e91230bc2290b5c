//! Committed blob hashes from the version-control tree.
//!
//! Non-source file dependencies are tracked by the SHA of the *committed*
//! version, never the working copy, so an uncommitted edit does not flip
//! the dependency. Lookups shell out to the `git` binary; if that fails
//! at the command level, tracking silently disables for the session.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;

/// Read-through cache of committed blob SHAs under one repository root.
pub struct VcsTree {
    root: PathBuf,
    disabled: AtomicBool,
    cache: DashMap<String, Option<String>, ahash::RandomState>,
}

impl VcsTree {
    /// Probe the root once: if git is missing or the root is not inside
    /// a work tree, lookups disable for the whole session rather than
    /// reporting every dependency as changed forever.
    pub fn open(root: impl Into<PathBuf>) -> VcsTree {
        let root = root.into();
        let disabled = !repo_available(&root);
        if disabled {
            tracing::debug!(root = %root.display(), "no usable repository, file dependencies disabled");
        }
        VcsTree {
            root,
            disabled: AtomicBool::new(disabled),
            cache: DashMap::default(),
        }
    }

    /// Blob SHA of the committed version of `path` (repo-relative), or
    /// `None` when the path is untracked or the tool is unavailable.
    pub fn committed_sha(&self, path: &str) -> Option<String> {
        if self.disabled.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(cached) = self.cache.get(path) {
            return cached.clone();
        }
        let sha = self.query(path);
        self.cache.insert(path.to_string(), sha.clone());
        sha
    }

    /// Drop cached lookups (a new commit may have landed).
    pub fn refresh(&self) {
        self.cache.clear();
    }

    /// True once the tool itself proved unavailable; lookups are then
    /// permanently `None` and dependents must not be invalidated.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    fn query(&self, path: &str) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .arg("rev-parse")
            .arg(format!("HEAD:{path}"))
            .output();
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                // git itself is missing; give up for the whole session
                self.disabled.store(true, Ordering::Relaxed);
                tracing::warn!(error = %err, "version-control tool unavailable, file dependencies disabled");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }
}

fn repo_available(root: &Path) -> bool {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .arg("rev-parse")
        .arg("--is-inside-work-tree")
        .output();
    match output {
        Ok(out) => {
            out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true"
        }
        Err(_) => false,
    }
}

/// True when `path` resolves inside `root`.
pub fn within_root(root: &Path, path: &Path) -> bool {
    use path_absolutize::Absolutize;
    let Ok(root) = root.absolutize() else {
        return false;
    };
    match path.absolutize() {
        Ok(abs) => abs.starts_with(&root),
        Err(_) => false,
    }
}

/// Project-relative form of `path`, when it lies inside `root`.
pub fn relativize(root: &Path, path: &Path) -> Option<String> {
    use path_absolutize::Absolutize;
    let root = root.absolutize().ok()?;
    let abs = path.absolutize().ok()?;
    let rel = abs.strip_prefix(&root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}
