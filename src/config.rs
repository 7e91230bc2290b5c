//! Runtime configuration: environment variables plus the host runner's
//! pass-through flags.
//!
//! `Config` covers where fingerprints are stored and how the network
//! store is reached; `RunOptions` covers per-run behavior (`--select`,
//! `--no-collect`, ...). Both are plain data; nothing here touches the
//! store.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Store location and network settings, resolved from the process
/// environment. All fields have workable defaults so a bare local run
/// needs no setup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Path of the local store database (`DATA_FILE`).
    pub data_file: PathBuf,
    /// Use the network store instead of the local one (`NET_ENABLED=true`).
    pub net_enabled: bool,
    /// Base URL of the network store (`SERVER`).
    pub server: Option<String>,
    /// Bearer token for the network store (`AUTH_TOKEN`).
    pub auth_token: Option<String>,
    /// Repository identity for store partitioning (`REPO_ID`).
    pub repo_id: String,
    /// Job identity for store partitioning (`JOB_ID`).
    pub job_id: String,
    /// Tag attached to history rows and graph artifacts (`RUN_ID`).
    pub run_id: Option<String>,
}

impl Config {
    /// Resolve from the process environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            data_file: std::env::var("DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_file),
            net_enabled: std::env::var("NET_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            server: std::env::var("SERVER").ok(),
            auth_token: std::env::var("AUTH_TOKEN").ok(),
            repo_id: std::env::var("REPO_ID").unwrap_or(defaults.repo_id),
            job_id: std::env::var("JOB_ID").unwrap_or(defaults.job_id),
            run_id: std::env::var("RUN_ID").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_file: PathBuf::from(".ezmon.db"),
            net_enabled: false,
            server: None,
            auth_token: None,
            repo_id: "local".to_string(),
            job_id: "default".to_string(),
            run_id: None,
        }
    }
}

/// Flags the host test runner forwards to ezmon.
#[derive(Parser, Serialize, Deserialize, Debug, Clone, Default)]
#[command(name = "ezmon", no_binary_name = true)]
pub struct RunOptions {
    /// Enable selection and collection.
    #[arg(long)]
    pub select: bool,

    /// Disable selection; collection still occurs.
    #[arg(long)]
    pub no_select: bool,

    /// Selection only; do not update the store.
    #[arg(long)]
    pub no_collect: bool,

    /// Apply selection even when the host has explicit filters.
    #[arg(long)]
    pub force_select: bool,

    /// Partition fingerprints per environment label.
    #[arg(long, value_name = "name")]
    pub env: Option<String>,

    /// Emit a dependency-graph artifact at finish.
    #[arg(long)]
    pub graph: bool,
}

impl RunOptions {
    /// Parse from the flag strings the host runner handed through.
    pub fn from_args<I, S>(args: I) -> Result<Self, crate::errors::EzmonError>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        RunOptions::try_parse_from(args)
            .map_err(|e| crate::errors::EzmonError::InvalidArgument(e.to_string()))
    }

    /// Whether tests should be partitioned this run.
    pub fn selection_enabled(&self) -> bool {
        self.select && !self.no_select
    }

    /// Whether fingerprints should be written back this run.
    pub fn collection_enabled(&self) -> bool {
        (self.select || self.no_select) && !self.no_collect
    }

    /// Environment label, defaulting when the host passed none.
    pub fn environment(&self) -> &str {
        self.env.as_deref().unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::RunOptions;

    /// Bare `--select` turns on both selection and collection.
    #[test]
    fn test_select_enables_both() {
        let opts = RunOptions::from_args(["--select"]).unwrap();
        assert!(opts.selection_enabled());
        assert!(opts.collection_enabled());
    }

    /// `--no-select` keeps collecting but never deselects.
    #[test]
    fn test_no_select_still_collects() {
        let opts = RunOptions::from_args(["--no-select"]).unwrap();
        assert!(!opts.selection_enabled());
        assert!(opts.collection_enabled());
    }

    /// `--no-collect` keeps selection but skips store updates.
    #[test]
    fn test_no_collect() {
        let opts = RunOptions::from_args(["--select", "--no-collect"]).unwrap();
        assert!(opts.selection_enabled());
        assert!(!opts.collection_enabled());
    }

    /// Environment label defaults and can be overridden.
    #[test]
    fn test_environment_label() {
        let opts = RunOptions::from_args(["--select"]).unwrap();
        assert_eq!(opts.environment(), "default");
        let opts = RunOptions::from_args(["--select", "--env", "py311"]).unwrap();
        assert_eq!(opts.environment(), "py311");
    }
}
