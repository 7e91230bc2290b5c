//! Wire format of the network store: JSON bodies, gzip-framed when they
//! exceed 1 KiB, one request/response pair per store operation.
//!
//! Checksum sets travel hex-encoded in their packed little-endian form.
//! A dependency entry may carry a server-assigned fingerprint id instead
//! of the full checksum array when the client has seen that fingerprint
//! before; a server that no longer knows the id answers `stale_fp` and
//! the client resends in full.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{Read, Write},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{EzmonError, Result},
    fingerprint::{pack_checksums, unpack_checksums},
    store::{CurrentFile, EnvironmentSpec, FingerprintRecord, RunStats, TestRecord},
};

/// Bodies larger than this are gzip-framed.
pub const GZIP_THRESHOLD: usize = 1024;

pub const HDR_REPO: &str = "x-repo-id";
pub const HDR_JOB: &str = "x-job-id";
pub const HDR_SESSION: &str = "x-session-id";

/// Endpoint paths, one per store operation.
pub mod endpoints {
    pub const INITIATE: &str = "/api/rpc/session/initiate";
    pub const FINISH: &str = "/api/rpc/session/finish";
    pub const INSERT: &str = "/api/rpc/tests/insert";
    pub const AFFECTED: &str = "/api/rpc/tests/affected";
    pub const DELETE: &str = "/api/rpc/tests/delete";
    pub const CHANGED: &str = "/api/rpc/files/changed";
    pub const META_READ: &str = "/api/rpc/meta/read";
    pub const META_WRITE: &str = "/api/rpc/meta/write";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub environment: EnvironmentSpec,
}

/// One per-file dependency of a test, §-wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepEntry {
    pub filename: String,
    /// Content hash of the file at collection time.
    pub fsha: String,
    #[serde(default)]
    pub mtime: f64,
    /// Hex of the packed little-endian checksum array. Absent when
    /// `fp_id` refers to a fingerprint the server already holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_checksums: Option<String>,
    /// Server-assigned fingerprint row id, when known to the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEntry {
    pub duration: f64,
    pub failed: bool,
    pub forced: bool,
    pub deps: Vec<DepEntry>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub local_imports: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_deps: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub external_deps: BTreeMap<String, String>,
}

/// Batch insert payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertRequest {
    pub exec_id: u64,
    pub tests: BTreeMap<String, TestEntry>,
}

/// Insert response: fingerprint row ids the client may cache, keyed by
/// `<filename>:<hex checksums>`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InsertResponse {
    #[serde(default)]
    pub fp_ids: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangedRequest {
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangedResponse {
    pub changed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AffectedRequest {
    pub current: BTreeMap<String, CurrentFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub test_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaReadRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaReadResponse {
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaWriteRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinishRequest {
    #[serde(flatten)]
    pub stats: RunStats,
}

/// Machine-readable error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Cache key for a fingerprint id: filename plus hex checksums.
pub fn fp_cache_key(filename: &str, checksums: &[u32]) -> String {
    format!("{filename}:{}", hex::encode(pack_checksums(checksums)))
}

impl TestEntry {
    pub fn from_record(record: &TestRecord) -> TestEntry {
        TestEntry {
            duration: record.duration,
            failed: record.failed,
            forced: record.forced,
            deps: record
                .fingerprints
                .iter()
                .map(|fp| DepEntry {
                    filename: fp.filename.clone(),
                    fsha: fp.content_hash.clone(),
                    mtime: fp.mtime,
                    method_checksums: Some(hex::encode(pack_checksums(&fp.checksums))),
                    fp_id: None,
                })
                .collect(),
            local_imports: record.local_imports.clone(),
            file_deps: record.file_deps.clone(),
            external_deps: record.external_deps.clone(),
        }
    }

    /// Rebuild a [`TestRecord`]; entries that only carry an `fp_id` are
    /// rejected here and must be resolved by the caller first.
    pub fn into_record(self, test_id: &str) -> Result<TestRecord> {
        let mut fingerprints = Vec::with_capacity(self.deps.len());
        for dep in self.deps {
            let Some(hex_sums) = dep.method_checksums else {
                return Err(EzmonError::payload(format!(
                    "dependency on {} carries no checksums",
                    dep.filename
                )));
            };
            let packed = hex::decode(&hex_sums)
                .map_err(|e| EzmonError::payload(format!("bad checksum hex: {e}")))?;
            fingerprints.push(FingerprintRecord {
                checksums: unpack_checksums(&dep.filename, &packed)?,
                filename: dep.filename,
                mtime: dep.mtime,
                content_hash: dep.fsha,
            });
        }
        Ok(TestRecord {
            test_id: test_id.to_string(),
            duration: self.duration,
            failed: self.failed,
            forced: self.forced,
            fingerprints,
            local_imports: self.local_imports,
            file_deps: self.file_deps,
            external_deps: self.external_deps,
        })
    }
}

/// Serialize to JSON, gzip when past the threshold. Returns the bytes
/// and whether they are gzip-framed.
pub fn encode_body<T: Serialize>(value: &T) -> Result<(Vec<u8>, bool)> {
    let json = serde_json::to_vec(value)?;
    if json.len() <= GZIP_THRESHOLD {
        return Ok((json, false));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok((encoder.finish()?, true))
}

/// Inverse of [`encode_body`], driven by the Content-Encoding header.
pub fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8], gzipped: bool) -> Result<T> {
    if !gzipped {
        return Ok(serde_json::from_slice(bytes)?);
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
