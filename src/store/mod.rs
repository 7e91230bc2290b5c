//! Persistence of environments, fingerprints, and test executions.
//!
//! The boundary between the local SQLite store and the network-backed
//! store is one capability set: `initiate`, `insert_test_executions`,
//! `changed_files`, `affected_tests`, `delete_tests`, `read_meta`,
//! `write_meta`, `finish`. Both implementations satisfy the same
//! contract, so the session orchestrator never knows which one it holds.
//!
//! `initiate` front-loads everything the selector reads (known
//! filenames, test metadata, file and external dependencies) so the hot
//! path afterwards is write-mostly.

pub mod local;

pub use local::LocalStore;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Identity tuple of the surrounding toolchain and package set.
/// Fingerprints are only comparable within one environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    /// Canonical descriptor of installed packages; any change here
    /// supersedes the environment.
    pub system_packages: String,
    pub language_version: String,
}

impl EnvironmentSpec {
    /// Describe the running environment: lockfile package set plus the
    /// toolchain version. An unavailable toolchain reads as `unknown`.
    pub fn detect(root: &std::path::Path, name: &str) -> EnvironmentSpec {
        let packages = crate::deps::packages::PackageIndex::from_lockfile(root);
        let language_version = std::process::Command::new("rustc")
            .arg("--version")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        EnvironmentSpec {
            name: name.to_string(),
            system_packages: packages.descriptor(),
            language_version,
        }
    }
}

/// One fingerprint destined for the store: which file, which checksums,
/// and the file state observed at collection time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub filename: String,
    /// Sorted, deduplicated block checksums.
    pub checksums: Vec<u32>,
    pub mtime: f64,
    pub content_hash: String,
}

/// Everything recorded for one executed test.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_id: String,
    pub duration: f64,
    pub failed: bool,
    pub forced: bool,
    pub fingerprints: Vec<FingerprintRecord>,
    /// Project-relative source files the dependency tracker saw
    /// imported; feeds the local edges of the dependency graph.
    #[serde(default)]
    pub local_imports: BTreeSet<String>,
    /// Non-source file reads: path → committed blob SHA.
    pub file_deps: BTreeMap<String, String>,
    /// External packages: name → pinned version.
    pub external_deps: BTreeMap<String, String>,
}

/// Stored test metadata handed to the selector at session start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestSeed {
    pub test_id: String,
    pub duration: f64,
    pub failed: bool,
    pub forced: bool,
}

/// A file dependency and the tests linked to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDepSeed {
    pub filename: String,
    pub sha: String,
    pub tests: Vec<String>,
}

/// An external package dependency of one test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDepSeed {
    pub test_id: String,
    pub package: String,
    pub version: String,
}

/// Result of `initiate`: the session handle plus the read-side state the
/// selector works from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionSeed {
    /// Opaque session token, echoed on subsequent calls.
    pub session_id: String,
    /// Monotonic execution id for this run.
    pub exec_id: u64,
    pub env_id: i64,
    /// True when the environment's package descriptor differed from the
    /// stored one; the fresh environment starts with no observed tests.
    pub packages_changed: bool,
    /// Every filename referenced by any stored fingerprint.
    pub filenames: Vec<String>,
    pub tests: Vec<TestSeed>,
    pub file_deps: Vec<FileDepSeed>,
    pub external_deps: Vec<ExternalDepSeed>,
}

/// Current state of one changed file, as the selector computed it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentFile {
    /// Hex SHA-1 of the current bytes; empty when the file is gone.
    pub content_hash: String,
    pub mtime: f64,
    /// Sorted current block checksums; empty when the file is gone.
    pub checksums: Vec<u32>,
}

/// Outcome of the store-side match predicate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AffectedTests {
    /// Tests whose stored fingerprint can no longer be reconstructed
    /// from the current block checksums.
    pub affected: Vec<String>,
    /// Tests whose fingerprint bytes were corrupt; the rows were removed
    /// and the tests must be treated as unknown.
    pub quarantined: Vec<String>,
}

/// Aggregate statistics committed at session end.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_tests: u32,
    pub selected_tests: u32,
    /// Wall-clock saved by deselection, from stored durations.
    pub saved_time_ms: u64,
    /// Set when the host runner aborted; the final batch is partial.
    pub interrupted: bool,
    /// Client request to skip the historical copy.
    pub skip_history: bool,
}

/// Capability set shared by the local and network stores.
pub trait Store {
    /// Open a session for `env`, creating the environment on first use
    /// or superseding it when the package descriptor changed.
    fn initiate(&mut self, env: &EnvironmentSpec) -> Result<SessionSeed>;

    /// Persist a batch of executed tests with fingerprint deduplication.
    /// Batches within a session apply in call order.
    fn insert_test_executions(&mut self, batch: &[TestRecord]) -> Result<()>;

    /// Paths whose stored content hash differs from the provided one.
    /// Paths the store has never seen are not reported.
    fn changed_files(&mut self, hashes: &BTreeMap<String, String>) -> Result<BTreeSet<String>>;

    /// Evaluate the subset-match predicate for every test with a
    /// fingerprint over one of the given files. Stored rows that still
    /// match are refreshed to the current hash and mtime so the file
    /// stops reporting as changed on the next run.
    fn affected_tests(&mut self, current: &BTreeMap<String, CurrentFile>) -> Result<AffectedTests>;

    /// Remove tests (and their links, via cascade) from the session's
    /// environment.
    fn delete_tests(&mut self, test_ids: &[String]) -> Result<()>;

    fn read_meta(&mut self, key: &str) -> Result<Option<String>>;

    fn write_meta(&mut self, key: &str, value: &str) -> Result<()>;

    /// Commit aggregate statistics, copy history unless skipped, and
    /// trigger deferred environment cleanup.
    fn finish(&mut self, stats: &RunStats) -> Result<()>;
}
