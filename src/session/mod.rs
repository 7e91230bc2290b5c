//! Session lifecycle: `initiate → collect → finish`, batching, spill
//! fallback, and the user-visible summary.
//!
//! The orchestrator drives one run against either store implementation.
//! Test results buffer locally and flush in batches; a store that stays
//! unreachable downgrades the session to a local spill file, which the
//! next session against the same store replays. `initiate` and `finish`
//! failures are fatal to the session but must never take the host test
//! runner down with them, so they surface as plain errors.

use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::PathBuf,
    time::{Duration, Instant},
};

use colored::Colorize;

use crate::{
    errors::{EzmonError, Result},
    select::Selection,
    store::{EnvironmentSpec, RunStats, SessionSeed, Store, TestRecord},
};

/// Default number of test results per `record_batch` flush.
pub const DEFAULT_BATCH_SIZE: usize = 250;
/// Budget for the final best-effort flush when the host aborts.
const ABORT_FLUSH_BUDGET: Duration = Duration::from_secs(5);

/// Per-session knobs, all optional.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub batch_size: usize,
    /// Where deferred writes land when the store is unreachable.
    pub spill_path: PathBuf,
    /// Path of the dependency-graph artifact, when requested.
    pub graph_artifact: Option<PathBuf>,
    pub skip_history: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            spill_path: PathBuf::from(".ezmon.spill.jsonl"),
            graph_artifact: None,
            skip_history: false,
        }
    }
}

impl SessionConfig {
    /// Derive per-run paths from the resolved configuration: the spill
    /// file sits next to the store, the graph artifact only exists when
    /// the host asked for one.
    pub fn for_run(config: &crate::config::Config, options: &crate::config::RunOptions) -> Self {
        let mut spill_path = config.data_file.clone();
        spill_path.set_extension("spill.jsonl");
        let graph_artifact = options.graph.then(|| {
            let mut path = config.data_file.clone();
            path.set_extension("graph.json");
            path
        });
        SessionConfig {
            spill_path,
            graph_artifact,
            ..SessionConfig::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Initiated,
    Collecting,
}

/// Drives one test-run session against a [`Store`].
pub struct SessionOrchestrator {
    store: Box<dyn Store>,
    config: SessionConfig,
    state: State,
    seed: Option<SessionSeed>,
    pending: Vec<TestRecord>,
    graph_edges: BTreeSet<(String, String, String)>,
    started: Instant,
    spilled: bool,
}

impl SessionOrchestrator {
    pub fn new(store: Box<dyn Store>, config: SessionConfig) -> SessionOrchestrator {
        SessionOrchestrator {
            store,
            config,
            state: State::Idle,
            seed: None,
            pending: Vec::new(),
            graph_edges: BTreeSet::new(),
            started: Instant::now(),
            spilled: false,
        }
    }

    /// Open the session and return the selector's seed. Replays any
    /// spill file left behind by an earlier degraded session.
    pub fn initiate(&mut self, env: &EnvironmentSpec) -> Result<&SessionSeed> {
        if self.state != State::Idle {
            return Err(EzmonError::SessionState("session already open".into()));
        }
        let seed = self.store.initiate(env)?;
        tracing::debug!(session = %seed.session_id, exec = seed.exec_id, "session initiated");
        self.state = State::Initiated;
        self.started = Instant::now();
        // replayed records are not in the seed the selector sees; the
        // tests they describe simply stay unknown for this run
        self.replay_spill();
        Ok(self.seed.insert(seed))
    }

    pub fn seed(&self) -> Option<&SessionSeed> {
        self.seed.as_ref()
    }

    /// Queue one executed test; flushes when the batch fills up.
    pub fn record(&mut self, record: TestRecord) -> Result<()> {
        match self.state {
            State::Initiated | State::Collecting => self.state = State::Collecting,
            State::Idle => {
                return Err(EzmonError::SessionState("session not open".into()));
            }
        }
        self.collect_graph_edges(&record);
        self.pending.push(record);
        if self.pending.len() >= self.config.batch_size {
            self.flush();
        }
        Ok(())
    }

    /// Queue a batch of executed tests.
    pub fn record_batch(&mut self, batch: Vec<TestRecord>) -> Result<()> {
        for record in batch {
            self.record(record)?;
        }
        Ok(())
    }

    /// Commit the session: flush, emit the graph artifact, write stats,
    /// and print the summary line.
    pub fn finish(&mut self, selection: &Selection) -> Result<RunStats> {
        if self.state == State::Idle {
            return Err(EzmonError::SessionState("session not open".into()));
        }
        self.flush();
        self.write_graph_artifact();

        let stats = RunStats {
            total_tests: (selection.affected.len()
                + selection.unaffected.len()
                + selection.unknown.len()) as u32,
            selected_tests: selection.selected.len() as u32,
            saved_time_ms: self
                .seed
                .as_ref()
                .map(|seed| selection.saved_time_ms(seed))
                .unwrap_or(0),
            interrupted: false,
            skip_history: self.config.skip_history,
        };
        self.store.finish(&stats)?;
        tracing::debug!(
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            saved_ms = stats.saved_time_ms,
            "session finished"
        );
        self.state = State::Idle;
        announce(selection);
        Ok(stats)
    }

    /// Host-runner abort: best-effort flush within a fixed budget, then
    /// a partial commit. Never returns an error; previously recorded
    /// batches stay durable and nothing for the interrupted test lands.
    pub fn abort(&mut self) {
        if self.state == State::Idle {
            return;
        }
        let deadline = Instant::now() + ABORT_FLUSH_BUDGET;
        while !self.pending.is_empty() && Instant::now() < deadline {
            let take = self.pending.len().min(self.config.batch_size);
            let chunk: Vec<TestRecord> = self.pending.drain(..take).collect();
            if let Err(err) = self.store.insert_test_executions(&chunk) {
                tracing::warn!(error = %err, "abort flush failed, spilling remainder");
                self.spill(&chunk);
                break;
            }
        }
        if !self.pending.is_empty() {
            let rest: Vec<TestRecord> = self.pending.drain(..).collect();
            self.spill(&rest);
        }
        let stats = RunStats {
            interrupted: true,
            skip_history: self.config.skip_history,
            ..RunStats::default()
        };
        if let Err(err) = self.store.finish(&stats) {
            tracing::warn!(error = %err, "interrupted finish failed");
        }
        self.state = State::Idle;
    }

    /// Flush pending records; permanent store failure downgrades to the
    /// spill file with a non-fatal warning.
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch: Vec<TestRecord> = self.pending.drain(..).collect();
        if let Err(err) = self.store.insert_test_executions(&batch) {
            if !self.spilled {
                tracing::warn!(error = %err, "store unreachable, deferring writes to spill file");
            }
            self.spill(&batch);
        }
    }

    fn spill(&mut self, records: &[TestRecord]) {
        self.spilled = true;
        let write = || -> Result<()> {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.spill_path)?;
            for record in records {
                serde_json::to_writer(&mut file, record)?;
                file.write_all(b"\n")?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            tracing::warn!(error = %err, "spill write failed, dropping batch");
        }
    }

    /// Replay a spill file from an earlier degraded session, best
    /// effort, then truncate it.
    fn replay_spill(&mut self) {
        let Ok(raw) = fs::read_to_string(&self.config.spill_path) else {
            return;
        };
        let records: Vec<TestRecord> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if records.is_empty() {
            let _ = fs::remove_file(&self.config.spill_path);
            return;
        }
        tracing::info!(count = records.len(), "replaying spilled test results");
        for chunk in records.chunks(self.config.batch_size) {
            if let Err(err) = self.store.insert_test_executions(chunk) {
                tracing::warn!(error = %err, "spill replay failed, keeping file");
                return;
            }
        }
        let _ = fs::remove_file(&self.config.spill_path);
    }

    fn collect_graph_edges(&mut self, record: &TestRecord) {
        let Some(source) = record.test_id.split("::").next() else {
            return;
        };
        // local edges: tracked imports plus the files the test executed
        let locals = record
            .local_imports
            .iter()
            .chain(record.fingerprints.iter().map(|fp| &fp.filename));
        for target in locals {
            self.graph_edges
                .insert((source.to_string(), target.clone(), "local".to_string()));
        }
        for package in record.external_deps.keys() {
            self.graph_edges.insert((
                source.to_string(),
                package.clone(),
                "external".to_string(),
            ));
        }
    }

    fn write_graph_artifact(&self) {
        let Some(path) = &self.config.graph_artifact else {
            return;
        };
        let edges: Vec<serde_json::Value> = self
            .graph_edges
            .iter()
            .map(|(source, target, kind)| {
                serde_json::json!({ "source": source, "target": target, "kind": kind })
            })
            .collect();
        let doc = serde_json::json!({ "edges": edges });
        if let Err(err) = fs::write(path, doc.to_string()) {
            tracing::warn!(error = %err, "dependency-graph artifact not written");
        }
    }
}

/// Print the one-line run summary.
fn announce(selection: &Selection) {
    let line = format!(
        "ezmon: {} affected, {} unaffected, {} unknown",
        selection.affected.len().to_string().red().bold(),
        selection.unaffected.len().to_string().green().bold(),
        selection.unknown.len().to_string().yellow().bold(),
    );
    eprintln!("{line}");
}
