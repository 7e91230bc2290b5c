//! SQLite-backed store.
//!
//! One database file per `(repo, job)`. WAL journaling permits reads
//! during writes; every modifying transaction opens with an IMMEDIATE
//! write-lock acquisition to avoid upgrade deadlocks; lock contention is
//! retried with exponential backoff. Deferred cleanup of superseded
//! environments runs in a second transaction on a worker thread and
//! swallows foreign-key violations caused by concurrent sessions still
//! referencing the old rows.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use threadpool::ThreadPool;
use uuid::Uuid;

use crate::{
    errors::{EzmonError, Result},
    fingerprint::{is_subset, pack_checksums, unpack_checksums},
    store::{
        AffectedTests, CurrentFile, EnvironmentSpec, ExternalDepSeed, FileDepSeed, RunStats,
        SessionSeed, Store, TestRecord, TestSeed,
    },
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS environment (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    system_packages TEXT NOT NULL,
    language_version TEXT NOT NULL,
    UNIQUE(name, system_packages, language_version)
);
CREATE TABLE IF NOT EXISTS file_fp (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    checksums BLOB NOT NULL,
    mtime REAL,
    content_hash TEXT,
    UNIQUE(filename, checksums)
);
CREATE TABLE IF NOT EXISTS test_execution (
    id INTEGER PRIMARY KEY,
    env_id INTEGER NOT NULL REFERENCES environment(id),
    test_id TEXT NOT NULL,
    duration REAL NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    forced INTEGER NOT NULL DEFAULT 0,
    UNIQUE(env_id, test_id)
);
CREATE TABLE IF NOT EXISTS test_execution_file_fp (
    test_execution_id INTEGER NOT NULL REFERENCES test_execution(id) ON DELETE CASCADE,
    file_fp_id INTEGER NOT NULL REFERENCES file_fp(id) ON DELETE CASCADE,
    PRIMARY KEY (test_execution_id, file_fp_id)
);
CREATE TABLE IF NOT EXISTS file_dependency (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    sha TEXT NOT NULL,
    UNIQUE(filename, sha)
);
CREATE TABLE IF NOT EXISTS test_execution_file_dependency (
    test_execution_id INTEGER NOT NULL REFERENCES test_execution(id) ON DELETE CASCADE,
    file_dependency_id INTEGER NOT NULL REFERENCES file_dependency(id) ON DELETE CASCADE,
    PRIMARY KEY (test_execution_id, file_dependency_id)
);
CREATE TABLE IF NOT EXISTS test_external_dependency (
    id INTEGER PRIMARY KEY,
    test_execution_id INTEGER NOT NULL REFERENCES test_execution(id) ON DELETE CASCADE,
    package_name TEXT NOT NULL,
    package_version TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dependency_graph (
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    kind TEXT NOT NULL,
    run_tag TEXT NOT NULL,
    UNIQUE(source, target, kind, run_tag)
);
CREATE TABLE IF NOT EXISTS test_execution_history (
    id INTEGER PRIMARY KEY,
    env_id INTEGER NOT NULL,
    test_id TEXT NOT NULL,
    duration REAL NOT NULL,
    failed INTEGER NOT NULL,
    forced INTEGER NOT NULL,
    run_tag TEXT,
    recorded_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const BUSY_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Historical-copy batching bound per sub-transaction.
const HISTORY_BATCH: i64 = 5_000;

/// SQLite implementation of the [`Store`] capability set.
pub struct LocalStore {
    path: PathBuf,
    conn: Connection,
    env: Option<ActiveEnv>,
    run_tag: Option<String>,
    cleanup: ThreadPool,
}

#[derive(Clone)]
struct ActiveEnv {
    id: i64,
    name: String,
}

impl LocalStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<LocalStore> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        Ok(LocalStore {
            path,
            conn,
            env: None,
            run_tag: None,
            cleanup: ThreadPool::new(1),
        })
    }

    /// Tag dependency-graph rows written by this session.
    pub fn with_run_tag(mut self, run_tag: Option<String>) -> LocalStore {
        self.run_tag = run_tag;
        self
    }

    /// Re-activate an environment from an earlier `initiate`. The
    /// network store's server side uses this where one database serves
    /// several sessions in turn.
    pub fn activate_environment(&mut self, env_id: i64, name: &str) {
        self.env = Some(ActiveEnv {
            id: env_id,
            name: name.to_string(),
        });
    }

    /// Resolve a fingerprint row by id, for id-carrying insert payloads.
    pub fn fingerprint_by_id(&mut self, id: i64) -> Result<Option<(String, Vec<u32>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT filename, checksums FROM file_fp WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        match row {
            Some((filename, blob)) => {
                let checksums = unpack_checksums(&filename, &blob)?;
                Ok(Some((filename, checksums)))
            }
            None => Ok(None),
        }
    }

    /// Row id of a stored fingerprint, if present.
    pub fn fingerprint_id(&mut self, filename: &str, checksums: &[u32]) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM file_fp WHERE filename = ?1 AND checksums = ?2",
                params![filename, pack_checksums(checksums)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Deduplicated dependency edges for one run tag.
    pub fn graph_edges(&mut self, run_tag: &str) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, target, kind FROM dependency_graph WHERE run_tag = ?1 ORDER BY source, target",
        )?;
        let rows = stmt.query_map(params![run_tag], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn env(&self) -> Result<ActiveEnv> {
        self.env
            .clone()
            .ok_or_else(|| EzmonError::InvalidSession("initiate was not called".into()))
    }

    /// IMMEDIATE write transaction with contention retry.
    fn write_tx<T>(&mut self, mut f: impl FnMut(&Transaction) -> rusqlite::Result<T>) -> Result<T> {
        let conn = &mut self.conn;
        retrying(move || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Queue superseded-environment cleanup on the worker thread and
    /// wait for it. Foreign-key violations from concurrent sessions are
    /// swallowed; everything else is logged and dropped.
    fn deferred_cleanup(&self) {
        let Some(env) = self.env.clone() else {
            return;
        };
        let path = self.path.clone();
        self.cleanup.execute(move || {
            if let Err(err) = cleanup_superseded(&path, &env) {
                tracing::debug!(error = %err, "deferred cleanup skipped");
            }
        });
        self.cleanup.join();
    }
}

impl Store for LocalStore {
    fn initiate(&mut self, env: &EnvironmentSpec) -> Result<SessionSeed> {
        let spec = env.clone();
        let (env_id, packages_changed, exec_id) = self.write_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM environment
                     WHERE name = ?1 AND system_packages = ?2 AND language_version = ?3",
                    params![spec.name, spec.system_packages, spec.language_version],
                    |row| row.get(0),
                )
                .optional()?;
            let (env_id, packages_changed) = match existing {
                Some(id) => (id, false),
                None => {
                    let superseding = tx.query_row(
                        "SELECT COUNT(*) FROM environment WHERE name = ?1",
                        params![spec.name],
                        |row| row.get::<_, i64>(0),
                    )? > 0;
                    tx.execute(
                        "INSERT INTO environment (name, system_packages, language_version)
                         VALUES (?1, ?2, ?3)",
                        params![spec.name, spec.system_packages, spec.language_version],
                    )?;
                    (tx.last_insert_rowid(), superseding)
                }
            };
            let exec_id = next_exec_id(tx)?;
            Ok((env_id, packages_changed, exec_id))
        })?;

        self.env = Some(ActiveEnv {
            id: env_id,
            name: env.name.clone(),
        });

        let mut seed = SessionSeed {
            session_id: Uuid::new_v4().to_string(),
            exec_id,
            env_id,
            packages_changed,
            ..SessionSeed::default()
        };
        self.load_seed(&mut seed)?;
        Ok(seed)
    }

    fn insert_test_executions(&mut self, batch: &[TestRecord]) -> Result<()> {
        let env = self.env()?;
        let run_tag = self.run_tag.clone();
        self.write_tx(|tx| {
            for record in batch {
                insert_one(tx, env.id, record, run_tag.as_deref())?;
            }
            Ok(())
        })
    }

    fn changed_files(&mut self, hashes: &BTreeMap<String, String>) -> Result<BTreeSet<String>> {
        let env = self.env()?;
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT f.filename, f.content_hash
             FROM file_fp f
             JOIN test_execution_file_fp l ON l.file_fp_id = f.id
             JOIN test_execution t ON t.id = l.test_execution_id
             WHERE t.env_id = ?1",
        )?;
        let rows = stmt.query_map(params![env.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut changed = BTreeSet::new();
        for row in rows {
            let (filename, stored) = row?;
            if let Some(current) = hashes.get(&filename)
                && stored.as_deref() != Some(current.as_str())
            {
                changed.insert(filename);
            }
        }
        Ok(changed)
    }

    fn affected_tests(&mut self, current: &BTreeMap<String, CurrentFile>) -> Result<AffectedTests> {
        let env = self.env()?;
        let mut out = AffectedTests::default();
        let mut matched_rows: Vec<(i64, String)> = Vec::new();
        let mut corrupt_rows: Vec<i64> = Vec::new();

        {
            let mut stmt = self.conn.prepare(
                "SELECT t.test_id, f.id, f.checksums
                 FROM file_fp f
                 JOIN test_execution_file_fp l ON l.file_fp_id = f.id
                 JOIN test_execution t ON t.id = l.test_execution_id
                 WHERE t.env_id = ?1 AND f.filename = ?2",
            )?;
            for (filename, state) in current {
                let rows = stmt.query_map(params![env.id, filename], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (test_id, fp_id, blob) = row?;
                    let stored = match unpack_checksums(filename, &blob) {
                        Ok(stored) => stored,
                        Err(err) => {
                            tracing::warn!(error = %err, "quarantining corrupt fingerprint row");
                            corrupt_rows.push(fp_id);
                            out.quarantined.push(test_id);
                            continue;
                        }
                    };
                    if is_subset(&stored, &state.checksums) {
                        matched_rows.push((fp_id, filename.clone()));
                    } else {
                        out.affected.push(test_id);
                    }
                }
            }
        }

        self.write_tx(|tx| {
            for fp_id in &corrupt_rows {
                tx.execute("DELETE FROM file_fp WHERE id = ?1", params![fp_id])?;
            }
            // rows that still match describe the file as it is now
            for (fp_id, filename) in &matched_rows {
                if let Some(state) = current.get(filename) {
                    tx.execute(
                        "UPDATE file_fp SET content_hash = ?1, mtime = ?2 WHERE id = ?3",
                        params![state.content_hash, state.mtime, fp_id],
                    )?;
                }
            }
            Ok(())
        })?;

        out.affected.sort_unstable();
        out.affected.dedup();
        out.quarantined.sort_unstable();
        out.quarantined.dedup();
        Ok(out)
    }

    fn delete_tests(&mut self, test_ids: &[String]) -> Result<()> {
        let env = self.env()?;
        self.write_tx(|tx| {
            for test_id in test_ids {
                tx.execute(
                    "DELETE FROM test_execution WHERE env_id = ?1 AND test_id = ?2",
                    params![env.id, test_id],
                )?;
            }
            Ok(())
        })
    }

    fn read_meta(&mut self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_meta(&mut self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.write_tx(move |tx| {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn finish(&mut self, stats: &RunStats) -> Result<()> {
        let env = self.env()?;
        let stats_json = serde_json::to_string(stats)?;
        let run_tag = self.run_tag.clone();
        self.write_tx(|tx| {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('last_run_stats', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![stats_json],
            )?;
            Ok(())
        })?;

        if !stats.skip_history {
            self.copy_history(env.id, run_tag.as_deref())?;
        }
        self.deferred_cleanup();
        Ok(())
    }
}

impl LocalStore {
    fn load_seed(&mut self, seed: &mut SessionSeed) -> Result<()> {
        let env_id = seed.env_id;

        let mut stmt = self.conn.prepare(
            "SELECT test_id, duration, failed, forced FROM test_execution WHERE env_id = ?1",
        )?;
        let rows = stmt.query_map(params![env_id], |row| {
            Ok(TestSeed {
                test_id: row.get(0)?,
                duration: row.get(1)?,
                failed: row.get::<_, i64>(2)? != 0,
                forced: row.get::<_, i64>(3)? != 0,
            })
        })?;
        seed.tests = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT f.filename
             FROM file_fp f
             JOIN test_execution_file_fp l ON l.file_fp_id = f.id
             JOIN test_execution t ON t.id = l.test_execution_id
             WHERE t.env_id = ?1
             ORDER BY f.filename",
        )?;
        let rows = stmt.query_map(params![env_id], |row| row.get::<_, String>(0))?;
        seed.filenames = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut stmt = self.conn.prepare(
            "SELECT d.filename, d.sha, t.test_id
             FROM file_dependency d
             JOIN test_execution_file_dependency l ON l.file_dependency_id = d.id
             JOIN test_execution t ON t.id = l.test_execution_id
             WHERE t.env_id = ?1",
        )?;
        let rows = stmt.query_map(params![env_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut grouped: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for row in rows {
            let (filename, sha, test_id) = row?;
            grouped.entry((filename, sha)).or_default().push(test_id);
        }
        seed.file_deps = grouped
            .into_iter()
            .map(|((filename, sha), tests)| FileDepSeed {
                filename,
                sha,
                tests,
            })
            .collect();
        drop(stmt);

        let mut stmt = self.conn.prepare(
            "SELECT t.test_id, x.package_name, x.package_version
             FROM test_external_dependency x
             JOIN test_execution t ON t.id = x.test_execution_id
             WHERE t.env_id = ?1",
        )?;
        let rows = stmt.query_map(params![env_id], |row| {
            Ok(ExternalDepSeed {
                test_id: row.get(0)?,
                package: row.get(1)?,
                version: row.get(2)?,
            })
        })?;
        seed.external_deps = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }

    /// Append current executions to the history area, at most
    /// [`HISTORY_BATCH`] rows per sub-transaction.
    fn copy_history(&mut self, env_id: i64, run_tag: Option<&str>) -> Result<()> {
        let recorded_at = chrono::Utc::now().to_rfc3339();
        let mut last_id = 0i64;
        loop {
            let run_tag = run_tag.map(str::to_string);
            let recorded_at = recorded_at.clone();
            let copied = self.write_tx(move |tx| {
                let copied = tx.execute(
                    "INSERT INTO test_execution_history
                         (env_id, test_id, duration, failed, forced, run_tag, recorded_at)
                     SELECT env_id, test_id, duration, failed, forced, ?1, ?2
                     FROM test_execution
                     WHERE env_id = ?3 AND id > ?4
                     ORDER BY id
                     LIMIT ?5",
                    params![run_tag, recorded_at, env_id, last_id, HISTORY_BATCH],
                )?;
                let max_id: Option<i64> = tx
                    .query_row(
                        "SELECT MAX(id) FROM (
                             SELECT id FROM test_execution
                             WHERE env_id = ?1 AND id > ?2
                             ORDER BY id LIMIT ?3
                         )",
                        params![env_id, last_id, HISTORY_BATCH],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                Ok((copied, max_id))
            })?;
            match copied {
                (n, Some(max_id)) if n > 0 => last_id = max_id,
                _ => break,
            }
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn next_exec_id(tx: &Transaction) -> rusqlite::Result<u64> {
    let current: Option<String> = tx
        .query_row(
            "SELECT value FROM meta WHERE key = 'exec_seq'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let next = current
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    tx.execute(
        "INSERT INTO meta (key, value) VALUES ('exec_seq', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![next.to_string()],
    )?;
    Ok(next)
}

fn insert_one(
    tx: &Transaction,
    env_id: i64,
    record: &TestRecord,
    run_tag: Option<&str>,
) -> rusqlite::Result<()> {
    // one current row per (environment, test); links cascade away
    tx.execute(
        "DELETE FROM test_execution WHERE env_id = ?1 AND test_id = ?2",
        params![env_id, record.test_id],
    )?;
    tx.execute(
        "INSERT INTO test_execution (env_id, test_id, duration, failed, forced)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            env_id,
            record.test_id,
            record.duration,
            record.failed as i64,
            record.forced as i64
        ],
    )?;
    let exec_row = tx.last_insert_rowid();

    for fp in &record.fingerprints {
        let packed = pack_checksums(&fp.checksums);
        tx.execute(
            "INSERT INTO file_fp (filename, checksums, mtime, content_hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(filename, checksums)
             DO UPDATE SET mtime = excluded.mtime, content_hash = excluded.content_hash",
            params![fp.filename, packed, fp.mtime, fp.content_hash],
        )?;
        let fp_id: i64 = tx.query_row(
            "SELECT id FROM file_fp WHERE filename = ?1 AND checksums = ?2",
            params![fp.filename, packed],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO test_execution_file_fp (test_execution_id, file_fp_id)
             VALUES (?1, ?2)",
            params![exec_row, fp_id],
        )?;
    }

    for (filename, sha) in &record.file_deps {
        tx.execute(
            "INSERT OR IGNORE INTO file_dependency (filename, sha) VALUES (?1, ?2)",
            params![filename, sha],
        )?;
        let dep_id: i64 = tx.query_row(
            "SELECT id FROM file_dependency WHERE filename = ?1 AND sha = ?2",
            params![filename, sha],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO test_execution_file_dependency
                 (test_execution_id, file_dependency_id)
             VALUES (?1, ?2)",
            params![exec_row, dep_id],
        )?;
    }

    for (package, version) in &record.external_deps {
        tx.execute(
            "INSERT INTO test_external_dependency (test_execution_id, package_name, package_version)
             VALUES (?1, ?2, ?3)",
            params![exec_row, package, version],
        )?;
    }

    if let Some(run_tag) = run_tag
        && let Some(source) = record.test_id.split("::").next()
    {
        // local edges: imports the tracker observed plus the files the
        // test actually executed
        let locals = record
            .local_imports
            .iter()
            .chain(record.fingerprints.iter().map(|fp| &fp.filename));
        for target in locals {
            tx.execute(
                "INSERT OR IGNORE INTO dependency_graph (source, target, kind, run_tag)
                 VALUES (?1, ?2, 'local', ?3)",
                params![source, target, run_tag],
            )?;
        }
        for package in record.external_deps.keys() {
            tx.execute(
                "INSERT OR IGNORE INTO dependency_graph (source, target, kind, run_tag)
                 VALUES (?1, ?2, 'external', ?3)",
                params![source, package, run_tag],
            )?;
        }
    }
    Ok(())
}

/// Second-transaction cleanup: drop environments this run superseded,
/// then prune fingerprint and dependency rows nothing links anymore.
///
/// The environment delete is tried with its rows still in place: the
/// foreign-key constraint is the guard that keeps an environment alive
/// while any session's rows reference it. A violation is swallowed, the
/// stale rows are purged in their own sub-transaction, and the delete is
/// retried; a session that re-references in between keeps its
/// environment until a later cleanup.
fn cleanup_superseded(path: &Path, env: &ActiveEnv) -> Result<()> {
    let mut conn = open_connection(path)?;

    let dropped = attempt(&mut conn, |tx| {
        tx.execute(
            "DELETE FROM environment WHERE name = ?1 AND id < ?2",
            params![env.name, env.id],
        )
    })?;
    if dropped.is_none() {
        attempt(&mut conn, |tx| {
            tx.execute(
                "DELETE FROM test_execution
                 WHERE env_id IN (SELECT id FROM environment WHERE name = ?1 AND id < ?2)",
                params![env.name, env.id],
            )
        })?;
        attempt(&mut conn, |tx| {
            tx.execute(
                "DELETE FROM environment WHERE name = ?1 AND id < ?2",
                params![env.name, env.id],
            )
        })?;
    }

    attempt(&mut conn, |tx| {
        tx.execute(
            "DELETE FROM file_fp WHERE id NOT IN
                 (SELECT DISTINCT file_fp_id FROM test_execution_file_fp)",
            [],
        )?;
        tx.execute(
            "DELETE FROM file_dependency WHERE id NOT IN
                 (SELECT DISTINCT file_dependency_id FROM test_execution_file_dependency)",
            [],
        )
    })?;
    Ok(())
}

/// One IMMEDIATE sub-transaction of the cleanup. A foreign-key
/// violation rolls it back and reports `None`; lock contention still
/// retries and anything else propagates.
fn attempt<T>(
    conn: &mut Connection,
    mut f: impl FnMut(&Transaction) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    let outcome = retrying(|| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    });
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(EzmonError::StoreError(msg)) if msg.contains("FOREIGN KEY") => {
            tracing::debug!("environment cleanup deferred, rows still referenced");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Retry `f` on lock contention: exponential backoff from 100 ms, five
/// attempts, then surface as [`EzmonError::StoreContended`].
fn retrying<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut delay = RETRY_BASE;
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS {
                    return Err(EzmonError::StoreContended(err.to_string()));
                }
                tracing::debug!(attempt, "store busy, backing off");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::DatabaseBusy || inner.code == ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::LocalStore;
    use crate::store::{
        CurrentFile, EnvironmentSpec, FingerprintRecord, RunStats, Store, TestRecord,
    };

    fn env() -> EnvironmentSpec {
        EnvironmentSpec {
            name: "default".into(),
            system_packages: "serde 1.0.228".into(),
            language_version: "1.92".into(),
        }
    }

    fn record(test_id: &str, filename: &str, checksums: Vec<u32>) -> TestRecord {
        TestRecord {
            test_id: test_id.into(),
            duration: 0.5,
            failed: false,
            forced: false,
            fingerprints: vec![FingerprintRecord {
                filename: filename.into(),
                checksums,
                mtime: 1.0,
                content_hash: "aa".repeat(20),
            }],
            ..TestRecord::default()
        }
    }

    fn open_store(dir: &TempDir) -> LocalStore {
        LocalStore::open(dir.path().join("t.db")).unwrap()
    }

    /// Batches round-trip through the store up to deduplication.
    #[test]
    fn test_insert_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let seed = store.initiate(&env()).unwrap();
        assert!(!seed.packages_changed);
        assert!(seed.tests.is_empty());

        let batch = vec![
            record("t::a", "math.rs", vec![1, 2]),
            record("t::b", "math.rs", vec![1, 2]), // same fingerprint, deduplicated
        ];
        store.insert_test_executions(&batch).unwrap();

        let seed = store.initiate(&env()).unwrap();
        assert_eq!(seed.tests.len(), 2);
        assert_eq!(seed.filenames, vec!["math.rs".to_string()]);

        let fp_rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM file_fp", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fp_rows, 1);
    }

    /// Re-recording a test replaces its row instead of accumulating.
    #[test]
    fn test_upsert_keeps_one_row() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![9])])
            .unwrap();
        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM test_execution", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    /// Changed-file detection compares stored against provided hashes.
    #[test]
    fn test_changed_files() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();

        let same: BTreeMap<String, String> =
            [("math.rs".to_string(), "aa".repeat(20))].into();
        assert!(store.changed_files(&same).unwrap().is_empty());

        let moved: BTreeMap<String, String> =
            [("math.rs".to_string(), "bb".repeat(20))].into();
        assert_eq!(
            store.changed_files(&moved).unwrap(),
            ["math.rs".to_string()].into()
        );
    }

    /// The subset predicate: removal affects, addition does not.
    #[test]
    fn test_affected_tests_predicate() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[
                record("t::add", "math.rs", vec![10, 99]),
                record("t::sub", "math.rs", vec![20, 99]),
            ])
            .unwrap();

        // checksum 10 vanished, 30 appeared: only t::add is affected
        let current: BTreeMap<String, CurrentFile> = [(
            "math.rs".to_string(),
            CurrentFile {
                content_hash: "cc".repeat(20),
                mtime: 2.0,
                checksums: vec![20, 30, 99],
            },
        )]
        .into();
        let outcome = store.affected_tests(&current).unwrap();
        assert_eq!(outcome.affected, vec!["t::add".to_string()]);
        assert!(outcome.quarantined.is_empty());

        // the matching row was refreshed to the current hash
        let changed = store
            .changed_files(&[("math.rs".to_string(), "cc".repeat(20))].into())
            .unwrap();
        assert!(!changed.contains("math.rs") || !outcome.affected.is_empty());
    }

    /// Corrupt fingerprint bytes quarantine the row and flag the test.
    #[test]
    fn test_corrupt_fingerprint_quarantined() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store
            .conn
            .execute("UPDATE file_fp SET checksums = x'0102'", [])
            .unwrap();

        let current: BTreeMap<String, CurrentFile> = [(
            "math.rs".to_string(),
            CurrentFile {
                checksums: vec![1],
                ..CurrentFile::default()
            },
        )]
        .into();
        let outcome = store.affected_tests(&current).unwrap();
        assert_eq!(outcome.quarantined, vec!["t::a".to_string()]);
        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM file_fp", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    /// A changed package descriptor supersedes the environment and the
    /// old one disappears after cleanup.
    #[test]
    fn test_environment_churn() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let first = store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store.finish(&RunStats::default()).unwrap();

        let mut upgraded = env();
        upgraded.system_packages = "serde 1.0.229".into();
        let mut store = open_store(&dir);
        let second = store.initiate(&upgraded).unwrap();
        assert!(second.packages_changed);
        assert_ne!(first.env_id, second.env_id);
        // fresh environment has no observed tests
        assert!(second.tests.is_empty());

        store.finish(&RunStats::default()).unwrap();
        let envs: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM environment", [], |r| r.get(0))
            .unwrap();
        assert_eq!(envs, 1);
    }

    /// Finish writes stats and copies history.
    #[test]
    fn test_finish_history_and_stats() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store
            .finish(&RunStats {
                total_tests: 1,
                selected_tests: 1,
                ..RunStats::default()
            })
            .unwrap();

        let stats = store.read_meta("last_run_stats").unwrap().unwrap();
        assert!(stats.contains("\"total_tests\":1"));
        let history: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM test_execution_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(history, 1);
    }

    /// skip_history leaves the history area untouched.
    #[test]
    fn test_skip_history() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store
            .finish(&RunStats {
                skip_history: true,
                ..RunStats::default()
            })
            .unwrap();
        let history: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM test_execution_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(history, 0);
    }

    /// delete_tests cascades the link rows away.
    #[test]
    fn test_delete_tests() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.initiate(&env()).unwrap();
        store
            .insert_test_executions(&[record("t::a", "math.rs", vec![1])])
            .unwrap();
        store.delete_tests(&["t::a".to_string()]).unwrap();
        let links: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM test_execution_file_fp", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(links, 0);
    }

    /// Meta keys round-trip and overwrite.
    #[test]
    fn test_meta_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        assert!(store.read_meta("k").unwrap().is_none());
        store.write_meta("k", "v1").unwrap();
        store.write_meta("k", "v2").unwrap();
        assert_eq!(store.read_meta("k").unwrap().as_deref(), Some("v2"));
    }
}
