//! Observation of non-coverage dependencies during collection and
//! execution: non-source file reads, local module imports, and external
//! package imports.
//!
//! The tracker is a two-mode state machine. During *collection* events
//! are attributed to the current test file; during *execution* to the
//! running test. Hooks report events through a process-global slot that
//! is installed for the session and restored on every exit path via
//! [`HookGuard`]. Observation never surfaces errors into the test body;
//! a failed lookup simply omits the event.

pub mod packages;
pub mod vcs;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{EzmonError, Result};

use packages::PackageIndex;
use vcs::VcsTree;

/// Everything observed for one attribution key (test id or test file).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedDeps {
    /// Non-source files read, keyed by path with the committed blob SHA.
    pub file_deps: BTreeMap<String, String>,
    /// Project-relative source files imported.
    pub local_imports: BTreeSet<String>,
    /// External packages imported, keyed by name with pinned version.
    pub external_deps: BTreeMap<String, String>,
}

impl TrackedDeps {
    pub fn is_empty(&self) -> bool {
        self.file_deps.is_empty() && self.local_imports.is_empty() && self.external_deps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Collecting { context: Option<String> },
    Executing { test_id: String },
}

/// Crates that ship with the toolchain; imports of these are never
/// external dependencies.
const TOOLCHAIN_CRATES: &[&str] = &["std", "core", "alloc", "proc_macro", "test"];

/// Observes imports and file reads and attributes them to the active
/// test or test file.
pub struct DependencyTracker {
    root: PathBuf,
    vcs: VcsTree,
    packages: PackageIndex,
    /// Filenames the store already tracks as sources; used to
    /// short-circuit the "is this a source file" test.
    known_sources: HashSet<String>,
    phase: Phase,
    records: AHashMap<String, TrackedDeps>,
}

impl DependencyTracker {
    pub fn new(root: impl Into<PathBuf>) -> DependencyTracker {
        let root = root.into();
        DependencyTracker {
            vcs: VcsTree::open(&root),
            packages: PackageIndex::from_lockfile(&root),
            root,
            known_sources: HashSet::new(),
            phase: Phase::Idle,
            records: AHashMap::new(),
        }
    }

    /// Seed the set of filenames the store already knows as sources.
    pub fn set_known_sources(&mut self, filenames: impl IntoIterator<Item = String>) {
        self.known_sources = filenames.into_iter().collect();
    }

    pub fn start_collection(&mut self) -> Result<()> {
        self.enter(Phase::Collecting { context: None })
    }

    /// Attribute collection-time events to `file` from here on.
    pub fn set_collection_context(&mut self, file: &str) -> Result<()> {
        match &mut self.phase {
            Phase::Collecting { context } => {
                *context = Some(file.to_string());
                Ok(())
            }
            _ => Err(EzmonError::SessionState("not collecting".into())),
        }
    }

    /// Leave collection mode, draining everything attributed so far.
    pub fn stop_collection(&mut self) -> Result<AHashMap<String, TrackedDeps>> {
        match self.phase {
            Phase::Collecting { .. } => {
                self.phase = Phase::Idle;
                Ok(std::mem::take(&mut self.records))
            }
            _ => Err(EzmonError::SessionState("not collecting".into())),
        }
    }

    pub fn start_test(&mut self, test_id: &str) -> Result<()> {
        self.enter(Phase::Executing {
            test_id: test_id.to_string(),
        })
    }

    /// Leave execution mode, draining the test's observations.
    pub fn stop_test(&mut self) -> Result<(String, TrackedDeps)> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Executing { test_id } => {
                let deps = self.records.remove(&test_id).unwrap_or_default();
                self.records.clear();
                Ok((test_id, deps))
            }
            other => {
                self.phase = other;
                Err(EzmonError::SessionState("no test executing".into()))
            }
        }
    }

    /// A module with a filesystem location was imported.
    pub fn observe_import(&mut self, location: &Path) {
        let Some(rel) = vcs::relativize(&self.root, location) else {
            return;
        };
        if let Some(deps) = self.active_record() {
            deps.local_imports.insert(rel);
        }
    }

    /// A package outside the project was imported.
    pub fn observe_package(&mut self, name: &str) {
        if TOOLCHAIN_CRATES.contains(&name) {
            return;
        }
        let Some(version) = self.packages.version_of(name).map(str::to_string) else {
            return;
        };
        if let Some(deps) = self.active_record() {
            deps.external_deps.insert(name.to_string(), version);
        }
    }

    /// A file inside the project was opened for reading.
    pub fn observe_file_read(&mut self, path: &Path) {
        let Some(rel) = vcs::relativize(&self.root, path) else {
            return;
        };
        if rel.ends_with(".rs") || self.known_sources.contains(&rel) {
            return;
        }
        let Some(sha) = self.vcs.committed_sha(&rel) else {
            return;
        };
        if let Some(deps) = self.active_record() {
            deps.file_deps.insert(rel, sha);
        }
    }

    /// Committed-SHA lookups for the selector's file-dependency check.
    pub fn vcs(&self) -> &VcsTree {
        &self.vcs
    }

    /// Lockfile versions for the selector's external-dependency check.
    pub fn packages(&self) -> &PackageIndex {
        &self.packages
    }

    fn enter(&mut self, next: Phase) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(EzmonError::SessionState(format!(
                "cannot enter {next:?} from {:?}",
                self.phase
            )));
        }
        self.phase = next;
        Ok(())
    }

    fn active_record(&mut self) -> Option<&mut TrackedDeps> {
        let key = match &self.phase {
            Phase::Collecting { context } => context.clone()?,
            Phase::Executing { test_id } => test_id.clone(),
            Phase::Idle => return None,
        };
        Some(self.records.entry(key).or_default())
    }
}

static ACTIVE: RwLock<Option<Arc<Mutex<DependencyTracker>>>> = RwLock::new(None);

/// Install `tracker` as the process-global event sink. The returned
/// guard restores the previous sink when dropped, on every exit path.
#[must_use = "dropping the guard uninstalls the tracker"]
pub fn install(tracker: Arc<Mutex<DependencyTracker>>) -> HookGuard {
    let prev = match ACTIVE.write() {
        Ok(mut slot) => slot.replace(tracker),
        Err(_) => None,
    };
    HookGuard { prev }
}

/// Scoped installation of the global tracker slot.
pub struct HookGuard {
    prev: Option<Arc<Mutex<DependencyTracker>>>,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = ACTIVE.write() {
            *slot = self.prev.take();
        }
    }
}

fn with_active(f: impl FnOnce(&mut DependencyTracker)) {
    if let Ok(slot) = ACTIVE.read()
        && let Some(tracker) = slot.as_ref()
        && let Ok(mut tracker) = tracker.lock()
    {
        f(&mut tracker);
    }
}

/// Hook entry: a module import was resolved to `location`.
pub fn report_import(location: &Path) {
    with_active(|tracker| tracker.observe_import(location));
}

/// Hook entry: an external package was imported.
pub fn report_package(name: &str) {
    with_active(|tracker| tracker.observe_package(name));
}

/// Hook entry: a file was opened for reading.
pub fn report_file_read(path: &Path) {
    with_active(|tracker| tracker.observe_file_read(path));
}
