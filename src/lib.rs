//! ezmon is a test-impact analysis engine: it fingerprints the code
//! blocks each test actually executed, detects which blocks changed
//! since the previous run, and selects the smallest safe subset of
//! tests to re-run.
//!
//! The pipeline per run: the session orchestrator opens a session
//! against a store (local SQLite or the network RPC facade), the
//! selector classifies files and partitions tests, the host runner
//! executes the selected tests while the coverage adapter and the
//! dependency tracker collect raw observations, and the fingerprint
//! assembler turns those into per-file checksum sets that the
//! orchestrator batches back into the store.

pub mod blocks;
pub mod config;
pub mod coverage;
pub mod deps;
pub mod errors;
pub mod fingerprint;
pub mod hash;
pub mod net;
pub mod select;
pub mod session;
pub mod source;
pub mod store;

pub use config::{Config, RunOptions};
pub use errors::{EzmonError, Result};

/// Process exit codes of the host integration.
pub mod exit_code {
    /// Run completed, all selected tests passed.
    pub const SUCCESS: i32 = 0;
    /// Run completed with test failures.
    pub const TEST_FAILURES: i32 = 1;
    /// The core failed: store unreachable and no local fallback.
    pub const INTERNAL: i32 = 2;
}

/// Build the store the configuration asks for: the network facade when
/// `NET_ENABLED` is set, the local database otherwise.
pub fn open_store(config: &Config) -> Result<Box<dyn store::Store>> {
    if config.net_enabled {
        let server = config.server.as_deref().ok_or_else(|| {
            EzmonError::InvalidArgument("NET_ENABLED is set but SERVER is not".into())
        })?;
        Ok(Box::new(net::NetStore::new(
            server,
            config.repo_id.clone(),
            config.job_id.clone(),
            config.auth_token.clone(),
        )))
    } else {
        let store = store::LocalStore::open(&config.data_file)?
            .with_run_tag(config.run_id.clone());
        Ok(Box::new(store))
    }
}
