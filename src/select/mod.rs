//! Test selection: classify files, evaluate the match predicate, and
//! partition the test universe into affected / unaffected / unknown.
//!
//! The match is intentionally asymmetric: checksums appearing in the
//! current blocks never invalidate a stored fingerprint, only removal or
//! modification of a block the test depended on does. Safety always wins
//! ties: anything the engine cannot vouch for runs.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    deps::{packages::PackageIndex, vcs::VcsTree},
    errors::Result,
    source::SourceTree,
    store::{CurrentFile, SessionSeed, Store},
};

/// Host-runner inputs to one selection round.
#[derive(Clone, Debug, Default)]
pub struct SelectionRequest {
    /// Every test the host runner discovered this run.
    pub all_tests: Vec<String>,
    /// Tests the host wants executed regardless of fingerprints.
    pub always_run: BTreeSet<String>,
    /// Caller-supplied priority ordering for the front of the run.
    pub priority: Vec<String>,
}

/// The three partitions plus the concrete run order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub affected: BTreeSet<String>,
    pub unaffected: BTreeSet<String>,
    pub unknown: BTreeSet<String>,
    /// Everything that must run, ordered: previously-failing first, then
    /// always-run, then the priority list, then the rest longest-first.
    pub selected: Vec<String>,
}

impl Selection {
    /// The one-line summary shown to the user.
    pub fn summary(&self) -> String {
        format!(
            "ezmon: {} affected, {} unaffected, {} unknown",
            self.affected.len(),
            self.unaffected.len(),
            self.unknown.len()
        )
    }

    /// Stored duration of all deselected tests, for the saved-time stat.
    pub fn saved_time_ms(&self, seed: &SessionSeed) -> u64 {
        seed.tests
            .iter()
            .filter(|t| self.unaffected.contains(&t.test_id))
            .map(|t| (t.duration * 1000.0) as u64)
            .sum()
    }
}

/// Partition `request.all_tests` against the stored fingerprints.
pub fn partition(
    store: &mut dyn Store,
    tree: &SourceTree,
    vcs: &VcsTree,
    packages: &PackageIndex,
    seed: &SessionSeed,
    request: &SelectionRequest,
) -> Result<Selection> {
    let universe: BTreeSet<String> = request.all_tests.iter().cloned().collect();
    let known: BTreeSet<String> = seed.tests.iter().map(|t| t.test_id.clone()).collect();

    // a superseded environment starts from scratch: everything unknown
    if seed.packages_changed {
        let mut selection = Selection {
            unknown: universe,
            ..Selection::default()
        };
        selection.selected = order(&selection, seed, request);
        return Ok(selection);
    }

    let mut affected: BTreeSet<String> = BTreeSet::new();
    let mut unknown: BTreeSet<String> = universe.difference(&known).cloned().collect();

    // current hashes for every path any stored fingerprint references;
    // absent files hash to the empty string and so always read changed
    tree.warm(&seed.filenames);
    let mut hashes: BTreeMap<String, String> = BTreeMap::new();
    for filename in &seed.filenames {
        let hash = tree
            .content_hash(filename)?
            .map(|h| h.to_string())
            .unwrap_or_default();
        hashes.insert(filename.clone(), hash);
    }
    let changed = store.changed_files(&hashes)?;
    tracing::debug!(changed = changed.len(), tracked = hashes.len(), "classified files");

    let mut current: BTreeMap<String, CurrentFile> = BTreeMap::new();
    for filename in &changed {
        let state = match tree.snapshot(filename)? {
            Some(snap) => CurrentFile {
                content_hash: snap.content_hash.to_string(),
                mtime: snap.mtime,
                checksums: snap.module.checksums(),
            },
            // deleted files keep an empty block set; any stored
            // fingerprint over them fails the subset match
            None => CurrentFile::default(),
        };
        current.insert(filename.clone(), state);
    }
    let outcome = store.affected_tests(&current)?;
    affected.extend(outcome.affected);
    unknown.extend(outcome.quarantined);

    // non-source file dependencies re-resolve against the committed tree
    vcs.refresh();
    for dep in &seed.file_deps {
        match vcs.committed_sha(&dep.filename) {
            Some(sha) if sha == dep.sha => {}
            Some(_) | None if !vcs.is_disabled() => {
                affected.extend(dep.tests.iter().cloned());
            }
            _ => {}
        }
    }

    // external packages re-resolve against the lockfile
    if !packages.is_empty() {
        for dep in &seed.external_deps {
            if packages.version_of(&dep.package) != Some(dep.version.as_str()) {
                affected.insert(dep.test_id.clone());
            }
        }
    }

    // previously failing tests are always forced back in
    for test in &seed.tests {
        if test.failed {
            affected.insert(test.test_id.clone());
        }
    }

    // host-forced tests run even when their fingerprints match
    for test in &request.always_run {
        if known.contains(test) {
            affected.insert(test.clone());
        }
    }

    affected.retain(|t| universe.contains(t));
    unknown.retain(|t| universe.contains(t) && !affected.contains(t));
    let unaffected: BTreeSet<String> = known
        .iter()
        .filter(|t| universe.contains(*t) && !affected.contains(*t) && !unknown.contains(*t))
        .cloned()
        .collect();

    let mut selection = Selection {
        affected,
        unaffected,
        unknown,
        selected: Vec::new(),
    };
    selection.selected = order(&selection, seed, request);
    Ok(selection)
}

/// Run order over everything selected: previously-failing, always-run,
/// priority list, then remaining tests by descending stored duration so
/// long tests start early.
fn order(selection: &Selection, seed: &SessionSeed, request: &SelectionRequest) -> Vec<String> {
    let to_run: BTreeSet<&String> = selection.affected.union(&selection.unknown).collect();
    let failed: BTreeSet<&str> = seed
        .tests
        .iter()
        .filter(|t| t.failed)
        .map(|t| t.test_id.as_str())
        .collect();
    let durations: BTreeMap<&str, f64> = seed
        .tests
        .iter()
        .map(|t| (t.test_id.as_str(), t.duration))
        .collect();

    let mut rest: Vec<&String> = to_run.iter().copied().collect();
    rest.sort_by(|a, b| {
        let da = durations.get(a.as_str()).copied().unwrap_or(0.0);
        let db = durations.get(b.as_str()).copied().unwrap_or(0.0);
        db.partial_cmp(&da)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });

    let previously_failing: Vec<&String> = to_run
        .iter()
        .filter(|t| failed.contains(t.as_str()))
        .copied()
        .collect();
    let groups: [Vec<&String>; 4] = [
        previously_failing,
        request.always_run.iter().collect(),
        request.priority.iter().collect(),
        rest,
    ];

    let mut emitted: BTreeSet<&String> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(to_run.len());
    for group in groups {
        for test in group {
            if to_run.contains(test) && emitted.insert(test) {
                ordered.push(test.clone());
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{SelectionRequest, partition};
    use crate::{
        deps::{packages::PackageIndex, vcs::VcsTree},
        source::SourceTree,
        store::{EnvironmentSpec, FingerprintRecord, LocalStore, Store, TestRecord},
    };

    fn env() -> EnvironmentSpec {
        EnvironmentSpec {
            name: "default".into(),
            system_packages: "pkgs-v1".into(),
            language_version: "1.92".into(),
        }
    }

    fn record(test_id: &str, duration: f64, failed: bool) -> TestRecord {
        TestRecord {
            test_id: test_id.into(),
            duration,
            failed,
            fingerprints: vec![FingerprintRecord {
                filename: "math.rs".into(),
                checksums: vec![1],
                mtime: 1.0,
                content_hash: "aa".repeat(20),
            }],
            ..TestRecord::default()
        }
    }

    /// Affected tests order: failing, always-run, priority, longest-first.
    #[test]
    fn test_run_ordering() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("math.rs"), "fn f() {\n    1;\n}\n").unwrap();
        let mut store = LocalStore::open(dir.path().join("t.db")).unwrap();
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[
                record("t::failing", 1.0, true),
                record("t::quick", 0.1, false),
                record("t::slow", 5.0, false),
                record("t::medium", 2.0, false),
            ])
            .unwrap();
        let seed = store.initiate(&env()).unwrap();

        let request = SelectionRequest {
            all_tests: vec![
                "t::failing".into(),
                "t::quick".into(),
                "t::slow".into(),
                "t::medium".into(),
                "t::brand_new".into(),
            ],
            always_run: ["t::quick".to_string()].into(),
            priority: vec!["t::medium".into()],
        };
        let tree = SourceTree::new(dir.path());
        let selection = partition(
            &mut store,
            &tree,
            &VcsTree::open(dir.path()),
            &PackageIndex::default(),
            &seed,
            &request,
        )
        .unwrap();

        // every stored fingerprint misses the current checksums
        assert!(selection.affected.contains("t::failing"));
        assert!(selection.unknown.contains("t::brand_new"));
        assert_eq!(
            selection.selected,
            vec![
                "t::failing".to_string(),
                "t::quick".to_string(),
                "t::medium".to_string(),
                "t::slow".to_string(),
                "t::brand_new".to_string(),
            ]
        );
    }

    /// A superseded environment turns the whole universe unknown.
    #[test]
    fn test_packages_changed_runs_everything() {
        let dir = TempDir::new().unwrap();
        let mut store = LocalStore::open(dir.path().join("t.db")).unwrap();
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", 1.0, false)])
            .unwrap();

        let mut upgraded = env();
        upgraded.system_packages = "pkgs-v2".into();
        let seed = store.initiate(&upgraded).unwrap();
        assert!(seed.packages_changed);

        let request = SelectionRequest {
            all_tests: vec!["t::a".into(), "t::b".into()],
            ..SelectionRequest::default()
        };
        let tree = SourceTree::new(dir.path());
        let selection = partition(
            &mut store,
            &tree,
            &VcsTree::open(dir.path()),
            &PackageIndex::default(),
            &seed,
            &request,
        )
        .unwrap();
        assert_eq!(selection.unknown.len(), 2);
        assert!(selection.affected.is_empty());
        assert_eq!(selection.selected.len(), 2);
    }

    /// Without a usable repository, file dependencies are silently
    /// inert: a test with one stays deselected instead of re-running
    /// forever.
    #[test]
    fn test_file_deps_inert_without_repo() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("math.rs"), "fn f() {\n    1;\n}\n").unwrap();
        let tree = SourceTree::new(dir.path());
        let snap = tree.snapshot("math.rs").unwrap().unwrap();

        let mut store = LocalStore::open(dir.path().join("t.db")).unwrap();
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[TestRecord {
                test_id: "t::read".into(),
                duration: 0.1,
                fingerprints: vec![FingerprintRecord {
                    filename: "math.rs".into(),
                    checksums: snap.module.checksums(),
                    mtime: snap.mtime,
                    content_hash: snap.content_hash.to_string(),
                }],
                file_deps: [("config.json".to_string(), "00".repeat(20))].into(),
                ..TestRecord::default()
            }])
            .unwrap();
        let seed = store.initiate(&env()).unwrap();
        assert_eq!(seed.file_deps.len(), 1);

        let vcs = VcsTree::open(dir.path());
        assert!(vcs.is_disabled());
        let request = SelectionRequest {
            all_tests: vec!["t::read".into()],
            ..SelectionRequest::default()
        };
        let selection = partition(
            &mut store,
            &tree,
            &vcs,
            &PackageIndex::default(),
            &seed,
            &request,
        )
        .unwrap();
        assert!(selection.unaffected.contains("t::read"));
        assert!(selection.selected.is_empty());
    }

    /// New tests are unknown, not affected, and still selected.
    #[test]
    fn test_never_seen_test_is_unknown() {
        let dir = TempDir::new().unwrap();
        let mut store = LocalStore::open(dir.path().join("t.db")).unwrap();
        let seed = store.initiate(&env()).unwrap();
        let request = SelectionRequest {
            all_tests: vec!["t::new".into()],
            ..SelectionRequest::default()
        };
        let tree = SourceTree::new(dir.path());
        let selection = partition(
            &mut store,
            &tree,
            &VcsTree::open(dir.path()),
            &PackageIndex::default(),
            &seed,
            &request,
        )
        .unwrap();
        assert!(selection.unknown.contains("t::new"));
        assert_eq!(selection.summary(), "ezmon: 0 affected, 0 unaffected, 1 unknown");
    }
}
