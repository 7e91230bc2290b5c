//! Client/server round-trips over a real socket: session semantics,
//! gzip framing, fingerprint-id caching, auth, and environment churn.

use std::collections::BTreeMap;

use tempfile::TempDir;

use ezmon::{
    errors::EzmonError,
    net::{NetStore, ServerState, router},
    store::{CurrentFile, EnvironmentSpec, FingerprintRecord, Store, TestRecord},
};

fn env(packages: &str) -> EnvironmentSpec {
    EnvironmentSpec {
        name: "ci".into(),
        system_packages: packages.into(),
        language_version: "1.92".into(),
    }
}

fn record(n: usize) -> TestRecord {
    TestRecord {
        test_id: format!("tests/t.rs::case_{n}"),
        duration: 0.1 + n as f64 / 100.0,
        failed: false,
        forced: false,
        fingerprints: vec![FingerprintRecord {
            filename: "math.rs".into(),
            checksums: vec![7, 11, 13],
            mtime: 2.0,
            content_hash: "ab".repeat(20),
        }],
        ..TestRecord::default()
    }
}

async fn serve(dir: &TempDir, token: Option<&str>) -> String {
    let state = ServerState::new(dir.path().join("stores"), token.map(str::to_string));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Full session lifecycle: initiate, large (gzipped) insert, id-cached
/// re-insert, selection reads, meta, finish.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_roundtrip() {
    let dir = TempDir::new().unwrap();
    let base = serve(&dir, Some("sesame")).await;

    tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base.as_str(), "repo", "job", Some("sesame".into()));
        let seed = store.initiate(&env("pkgs-v1")).unwrap();
        assert!(!seed.packages_changed);
        assert!(seed.tests.is_empty());

        // 64 tests push the payload well past the gzip threshold
        let batch: Vec<TestRecord> = (0..64).map(record).collect();
        store.insert_test_executions(&batch).unwrap();
        // second insert travels with cached fingerprint ids
        store.insert_test_executions(&batch).unwrap();

        let seed = store.initiate(&env("pkgs-v1")).unwrap();
        assert_eq!(seed.tests.len(), 64);
        assert_eq!(seed.filenames, vec!["math.rs".to_string()]);

        let changed = store
            .changed_files(&[("math.rs".to_string(), "cd".repeat(20))].into())
            .unwrap();
        assert!(changed.contains("math.rs"));

        let current: BTreeMap<String, CurrentFile> = [(
            "math.rs".to_string(),
            CurrentFile {
                content_hash: "cd".repeat(20),
                mtime: 3.0,
                checksums: vec![11, 13], // checksum 7 vanished
            },
        )]
        .into();
        let outcome = store.affected_tests(&current).unwrap();
        assert_eq!(outcome.affected.len(), 64);

        store.write_meta("team", "payments").unwrap();
        assert_eq!(store.read_meta("team").unwrap().as_deref(), Some("payments"));

        store.delete_tests(&["tests/t.rs::case_0".to_string()]).unwrap();
        store.finish(&Default::default()).unwrap();

        // the session is gone after finish
        let err = store
            .changed_files(&BTreeMap::new())
            .expect_err("session should be closed");
        assert!(matches!(
            err,
            EzmonError::Unauthorized(_) | EzmonError::ServerStatus(..)
        ));
    })
    .await
    .unwrap();
}

/// A wrong bearer token is rejected before any store work.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_token_rejected() {
    let dir = TempDir::new().unwrap();
    let base = serve(&dir, Some("sesame")).await;

    tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base.as_str(), "repo", "job", Some("wrong".into()));
        let err = store.initiate(&env("pkgs-v1")).expect_err("must reject");
        assert!(matches!(err, EzmonError::Unauthorized(_)));
    })
    .await
    .unwrap();
}

/// Environment churn over the wire: a changed package descriptor yields
/// `packages_changed`, a fresh environment, and no stale rows.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_environment_churn() {
    let dir = TempDir::new().unwrap();
    let base = serve(&dir, None).await;

    tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base.as_str(), "repo", "job", None);
        let first = store.initiate(&env("pkgs-v1")).unwrap();
        store.insert_test_executions(&[record(0)]).unwrap();
        store.finish(&Default::default()).unwrap();

        let second = store.initiate(&env("pkgs-v2")).unwrap();
        assert!(second.packages_changed);
        assert_ne!(first.env_id, second.env_id);
        assert!(second.tests.is_empty());
        store.insert_test_executions(&[record(1)]).unwrap();
        store.finish(&Default::default()).unwrap();

        // after cleanup only the new environment's rows remain
        let third = store.initiate(&env("pkgs-v2")).unwrap();
        assert_eq!(third.env_id, second.env_id);
        assert_eq!(third.tests.len(), 1);
    })
    .await
    .unwrap();
}

/// Concurrent churn: one session changes the package descriptor and
/// finishes while the other still holds rows under the old environment.
/// The cleanup's environment delete hits that live foreign-key
/// reference, swallows it, and neither client sees an error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_swallows_cleanup() {
    let dir = TempDir::new().unwrap();
    let base = serve(&dir, None).await;

    let (a_seeded, on_a_seeded) = std::sync::mpsc::channel::<i64>();
    let (b_done, on_b_done) = std::sync::mpsc::channel::<i64>();

    let base_a = base.clone();
    let a = tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base_a.as_str(), "repo", "job", None);
        let seed = store.initiate(&env("pkgs-v1")).unwrap();
        store.insert_test_executions(&[record(0)]).unwrap();
        a_seeded.send(seed.env_id).unwrap();
        // the churned session finishes (and runs cleanup against this
        // session's live rows) before this session closes
        let new_env = on_b_done.recv().unwrap();
        assert_ne!(new_env, seed.env_id);
        store.finish(&Default::default()).unwrap();
    });
    let base_b = base.clone();
    let b = tokio::task::spawn_blocking(move || {
        let old_env = on_a_seeded.recv().unwrap();
        let mut store = NetStore::new(base_b.as_str(), "repo", "job", None);
        let seed = store.initiate(&env("pkgs-v2")).unwrap();
        assert!(seed.packages_changed);
        assert_ne!(seed.env_id, old_env);
        store.insert_test_executions(&[record(1)]).unwrap();
        store.finish(&Default::default()).unwrap();
        b_done.send(seed.env_id).unwrap();
    });
    a.await.unwrap();
    b.await.unwrap();

    // all sessions converged on the latest environment; the stale one
    // and its rows are gone
    let check = tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base.as_str(), "repo", "job", None);
        let seed = store.initiate(&env("pkgs-v2")).unwrap();
        assert!(!seed.packages_changed);
        assert_eq!(seed.tests.len(), 1);
        assert_eq!(seed.tests[0].test_id, "tests/t.rs::case_1");
    });
    check.await.unwrap();
}

/// Two clients against the same repo/job serialize on the shared store
/// instead of failing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_serialize() {
    let dir = TempDir::new().unwrap();
    let base = serve(&dir, None).await;

    let base_a = base.clone();
    let a = tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base_a.as_str(), "repo", "job", None);
        store.initiate(&env("pkgs-v1")).unwrap();
        for n in 0..8 {
            store.insert_test_executions(&[record(n)]).unwrap();
        }
        store.finish(&Default::default()).unwrap();
    });
    let base_b = base.clone();
    let b = tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base_b.as_str(), "repo", "job", None);
        store.initiate(&env("pkgs-v1")).unwrap();
        for n in 8..16 {
            store.insert_test_executions(&[record(n)]).unwrap();
        }
        store.finish(&Default::default()).unwrap();
    });
    a.await.unwrap();
    b.await.unwrap();

    let check = tokio::task::spawn_blocking(move || {
        let mut store = NetStore::new(base.as_str(), "repo", "job", None);
        let seed = store.initiate(&env("pkgs-v1")).unwrap();
        assert_eq!(seed.tests.len(), 16);
    });
    check.await.unwrap();
}
