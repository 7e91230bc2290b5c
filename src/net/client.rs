//! HTTP client side of the network store.
//!
//! Implements the same [`Store`] capability set as the local store over
//! the RPC endpoints: persistent connection pool, gzip framing past the
//! 1 KiB threshold, exponential-backoff retry on 5xx and transport
//! errors, and an LRU cache of server-assigned fingerprint ids so
//! repeated fingerprints travel as ids instead of full checksum arrays.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use lru_mem::LruCache;
use serde::{Serialize, de::DeserializeOwned};
use ureq::Agent;

use crate::{
    errors::{EzmonError, Result},
    store::{
        AffectedTests, CurrentFile, EnvironmentSpec, RunStats, SessionSeed, Store, TestRecord,
    },
};

use super::wire::{
    self, AffectedRequest, ChangedRequest, ChangedResponse, DeleteRequest, FinishRequest,
    InitiateRequest, InsertRequest, InsertResponse, MetaReadRequest, MetaReadResponse,
    MetaWriteRequest, TestEntry, endpoints,
};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(30);
/// Fingerprint-id cache budget; roughly 1024 typical entries.
const FP_CACHE_BYTES: usize = 256 * 1024;

/// Network-backed [`Store`].
pub struct NetStore {
    agent: Agent,
    base: String,
    repo_id: String,
    job_id: String,
    auth_token: Option<String>,
    session_id: Option<String>,
    exec_id: u64,
    fp_ids: LruCache<String, i64>,
}

enum Outcome {
    Success(Vec<u8>),
    Failed { status: u16, message: String },
}

impl NetStore {
    pub fn new(
        server: impl Into<String>,
        repo_id: impl Into<String>,
        job_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> NetStore {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(120)))
            .http_status_as_error(false)
            .build()
            .into();
        NetStore {
            agent,
            base: server.into().trim_end_matches('/').to_string(),
            repo_id: repo_id.into(),
            job_id: job_id.into(),
            auth_token,
            session_id: None,
            exec_id: 0,
            fp_ids: LruCache::new(FP_CACHE_BYTES),
        }
    }

    fn rpc<Req: Serialize, Resp: DeserializeOwned>(&mut self, path: &str, req: &Req) -> Result<Resp> {
        let (body, gzipped) = wire::encode_body(req)?;
        let url = format!("{}{path}", self.base);
        let mut delay = RETRY_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retryable = attempt < RETRY_ATTEMPTS;
            match self.send_once(&url, &body, gzipped) {
                Ok(Outcome::Success(bytes)) => {
                    return serde_json::from_slice(&bytes).map_err(|e| {
                        EzmonError::payload(format!("bad response from {path}: {e}"))
                    });
                }
                Ok(Outcome::Failed { status, .. }) if status >= 500 && retryable => {
                    tracing::debug!(status, attempt, "server error, backing off");
                }
                Ok(Outcome::Failed { status, message }) => {
                    return Err(match status {
                        401 | 403 => EzmonError::Unauthorized(message),
                        _ => EzmonError::ServerStatus(status, message),
                    });
                }
                Err(err) if retryable => {
                    tracing::debug!(error = %err, attempt, "transport error, backing off");
                }
                Err(err) => return Err(EzmonError::network(err.to_string())),
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(RETRY_CAP);
        }
    }

    fn send_once(
        &mut self,
        url: &str,
        body: &[u8],
        gzipped: bool,
    ) -> std::result::Result<Outcome, ureq::Error> {
        let mut request = self
            .agent
            .post(url)
            .header("content-type", "application/json")
            .header(wire::HDR_REPO, &self.repo_id)
            .header(wire::HDR_JOB, &self.job_id);
        if gzipped {
            request = request.header("content-encoding", "gzip");
        }
        if let Some(token) = &self.auth_token {
            request = request.header("authorization", &format!("Bearer {token}"));
        }
        if let Some(session) = &self.session_id {
            request = request.header(wire::HDR_SESSION, session);
        }

        let mut response = request.send(body)?;
        if let Some(session) = response
            .headers()
            .get(wire::HDR_SESSION)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }
        let status = response.status().as_u16();
        let bytes = response.body_mut().read_to_vec()?;
        if (200..300).contains(&status) {
            Ok(Outcome::Success(bytes))
        } else {
            Ok(Outcome::Failed {
                status,
                message: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    }

    /// Build the wire batch, swapping full checksum arrays for cached
    /// fingerprint ids where possible.
    fn build_insert(&mut self, batch: &[TestRecord], use_cache: bool) -> InsertRequest {
        let mut tests = BTreeMap::new();
        for record in batch {
            let mut entry = TestEntry::from_record(record);
            if use_cache {
                for (dep, fp) in entry.deps.iter_mut().zip(&record.fingerprints) {
                    let key = wire::fp_cache_key(&fp.filename, &fp.checksums);
                    if let Some(id) = self.fp_ids.get(&key) {
                        dep.fp_id = Some(*id);
                        dep.method_checksums = None;
                    }
                }
            }
            tests.insert(record.test_id.clone(), entry);
        }
        InsertRequest {
            exec_id: self.exec_id,
            tests,
        }
    }

    fn remember_fp_ids(&mut self, response: &InsertResponse) {
        for (key, id) in &response.fp_ids {
            let _ = self.fp_ids.insert(key.clone(), *id);
        }
    }
}

impl Store for NetStore {
    fn initiate(&mut self, env: &EnvironmentSpec) -> Result<SessionSeed> {
        let request = InitiateRequest {
            environment: env.clone(),
        };
        let seed: SessionSeed = self.rpc(endpoints::INITIATE, &request)?;
        self.session_id = Some(seed.session_id.clone());
        self.exec_id = seed.exec_id;
        self.fp_ids.clear();
        Ok(seed)
    }

    fn insert_test_executions(&mut self, batch: &[TestRecord]) -> Result<()> {
        let request = self.build_insert(batch, true);
        let response: Result<InsertResponse> = self.rpc(endpoints::INSERT, &request);
        let response = match response {
            // the server forgot an id we cached: resend in full, once
            Err(EzmonError::ServerStatus(422, _)) => {
                self.fp_ids.clear();
                let request = self.build_insert(batch, false);
                self.rpc(endpoints::INSERT, &request)?
            }
            other => other?,
        };
        self.remember_fp_ids(&response);
        Ok(())
    }

    fn changed_files(&mut self, hashes: &BTreeMap<String, String>) -> Result<BTreeSet<String>> {
        let request = ChangedRequest {
            hashes: hashes.clone(),
        };
        let response: ChangedResponse = self.rpc(endpoints::CHANGED, &request)?;
        Ok(response.changed.into_iter().collect())
    }

    fn affected_tests(&mut self, current: &BTreeMap<String, CurrentFile>) -> Result<AffectedTests> {
        let request = AffectedRequest {
            current: current.clone(),
        };
        self.rpc(endpoints::AFFECTED, &request)
    }

    fn delete_tests(&mut self, test_ids: &[String]) -> Result<()> {
        let request = DeleteRequest {
            test_ids: test_ids.to_vec(),
        };
        let _: serde_json::Value = self.rpc(endpoints::DELETE, &request)?;
        Ok(())
    }

    fn read_meta(&mut self, key: &str) -> Result<Option<String>> {
        let request = MetaReadRequest {
            key: key.to_string(),
        };
        let response: MetaReadResponse = self.rpc(endpoints::META_READ, &request)?;
        Ok(response.value)
    }

    fn write_meta(&mut self, key: &str, value: &str) -> Result<()> {
        let request = MetaWriteRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        let _: serde_json::Value = self.rpc(endpoints::META_WRITE, &request)?;
        Ok(())
    }

    fn finish(&mut self, stats: &RunStats) -> Result<()> {
        let request = FinishRequest {
            stats: stats.clone(),
        };
        let _: serde_json::Value = self.rpc(endpoints::FINISH, &request)?;
        self.session_id = None;
        Ok(())
    }
}
