//! HTTP server side of the network store.
//!
//! One SQLite store per `(repo, job)`, each behind a mutex so operations
//! from concurrent sessions serialize at the database boundary; within a
//! session, calls apply in arrival order. Session state lives in memory
//! with a 30-minute TTL; the session id is returned by `initiate` and
//! echoed via `X-Session-Id` on every response.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    errors::{EzmonError, Result},
    store::{LocalStore, Store, TestRecord},
};

use super::wire::{
    self, AffectedRequest, ChangedRequest, ChangedResponse, DeleteRequest, ErrorBody,
    FinishRequest, InitiateRequest, InsertRequest, InsertResponse, MetaReadRequest,
    MetaReadResponse, MetaWriteRequest, endpoints,
};

/// Server-side session lifetime.
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
struct SessionEntry {
    repo: String,
    job: String,
    env_id: i64,
    env_name: String,
    expires_at: Instant,
}

/// Shared state of the RPC server.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<Inner>,
}

struct Inner {
    store_root: PathBuf,
    auth_token: Option<String>,
    sessions: DashMap<String, SessionEntry, ahash::RandomState>,
    stores: DashMap<String, Arc<Mutex<LocalStore>>, ahash::RandomState>,
}

impl ServerState {
    pub fn new(store_root: impl Into<PathBuf>, auth_token: Option<String>) -> ServerState {
        ServerState {
            inner: Arc::new(Inner {
                store_root: store_root.into(),
                auth_token,
                sessions: DashMap::default(),
                stores: DashMap::default(),
            }),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.inner.auth_token else {
            return Ok(());
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(EzmonError::Unauthorized("bad or missing bearer token".into()))
        }
    }

    fn store_for(&self, repo: &str, job: &str) -> Result<Arc<Mutex<LocalStore>>> {
        let key = format!("{}__{}", sanitize(repo), sanitize(job));
        if let Some(store) = self.inner.stores.get(&key) {
            return Ok(store.clone());
        }
        std::fs::create_dir_all(&self.inner.store_root)?;
        let store = LocalStore::open(self.inner.store_root.join(format!("{key}.db")))?;
        let store = Arc::new(Mutex::new(store));
        self.inner.stores.insert(key, store.clone());
        Ok(store)
    }

    fn session(&self, headers: &HeaderMap) -> Result<(String, SessionEntry)> {
        let id = headers
            .get(wire::HDR_SESSION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| EzmonError::InvalidSession("missing session id".into()))?;
        let entry = self
            .inner
            .sessions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| EzmonError::InvalidSession("unknown session".into()))?;
        if entry.expires_at < Instant::now() {
            self.inner.sessions.remove(id);
            return Err(EzmonError::InvalidSession("session expired".into()));
        }
        // sliding TTL: any call keeps the session alive
        self.inner.sessions.insert(
            id.to_string(),
            SessionEntry {
                expires_at: Instant::now() + SESSION_TTL,
                ..entry.clone()
            },
        );
        Ok((id.to_string(), entry))
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.inner.sessions.retain(|_, entry| entry.expires_at >= now);
    }
}

/// Build the RPC router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(endpoints::INITIATE, post(initiate))
        .route(endpoints::INSERT, post(insert))
        .route(endpoints::CHANGED, post(changed))
        .route(endpoints::AFFECTED, post(affected))
        .route(endpoints::DELETE, post(delete))
        .route(endpoints::META_READ, post(meta_read))
        .route(endpoints::META_WRITE, post(meta_write))
        .route(endpoints::FINISH, post(finish))
        .with_state(state)
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| EzmonError::payload(format!("missing {name} header")))
}

fn parse_body<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    wire::decode_body(body, gzipped)
}

fn json_response<T: Serialize>(session_id: Option<&str>, value: &T) -> Response {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => return error_response(&EzmonError::from(err)),
    };
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if let Some(id) = session_id
        && let Ok(value) = id.parse()
    {
        response.headers_mut().insert(wire::HDR_SESSION, value);
    }
    response
}

fn error_response(err: &EzmonError) -> Response {
    let (status, code) = match err {
        EzmonError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        EzmonError::InvalidSession(_) => (StatusCode::UNAUTHORIZED, "invalid_session"),
        EzmonError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        EzmonError::CorruptFingerprint(..) => (StatusCode::BAD_REQUEST, "bad_request"),
        EzmonError::ServerStatus(422, _) => (StatusCode::UNPROCESSABLE_ENTITY, "stale_fp"),
        EzmonError::StoreContended(_) => (StatusCode::SERVICE_UNAVAILABLE, "contended"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    let body = ErrorBody {
        code: code.to_string(),
        message: err.to_string(),
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec(&body).unwrap_or_default(),
    )
        .into_response()
}

/// Run a blocking store operation for an established session.
async fn with_session<Req, Resp, F>(
    state: ServerState,
    headers: HeaderMap,
    body: Bytes,
    op: F,
) -> Response
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: FnOnce(&mut LocalStore, Req) -> Result<Resp> + Send + 'static,
{
    let run = async {
        state.authorize(&headers)?;
        let (session_id, entry) = state.session(&headers)?;
        let request: Req = parse_body(&headers, &body)?;
        let store = state.store_for(&entry.repo, &entry.job)?;
        let response = tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| EzmonError::store("store mutex poisoned"))?;
            store.activate_environment(entry.env_id, &entry.env_name);
            op(&mut store, request)
        })
        .await
        .map_err(|e| EzmonError::store(format!("worker panicked: {e}")))??;
        Ok::<_, EzmonError>((session_id, response))
    };
    match run.await {
        Ok((session_id, response)) => json_response(Some(&session_id), &response),
        Err(err) => error_response(&err),
    }
}

async fn initiate(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let run = async {
        state.authorize(&headers)?;
        state.sweep_expired();
        let repo = header_value(&headers, wire::HDR_REPO)?;
        let job = header_value(&headers, wire::HDR_JOB)?;
        let request: InitiateRequest = parse_body(&headers, &body)?;
        let store = state.store_for(&repo, &job)?;
        let env_name = request.environment.name.clone();
        let seed = tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| EzmonError::store("store mutex poisoned"))?;
            store.initiate(&request.environment)
        })
        .await
        .map_err(|e| EzmonError::store(format!("worker panicked: {e}")))??;

        state.inner.sessions.insert(
            seed.session_id.clone(),
            SessionEntry {
                repo,
                job,
                env_id: seed.env_id,
                env_name,
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        Ok::<_, EzmonError>(seed)
    };
    match run.await {
        Ok(seed) => {
            let session_id = seed.session_id.clone();
            json_response(Some(&session_id), &seed)
        }
        Err(err) => error_response(&err),
    }
}

async fn insert(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(
        state,
        headers,
        body,
        |store, request: InsertRequest| -> Result<InsertResponse> {
            let batch = resolve_batch(store, request)?;
            store.insert_test_executions(&batch)?;
            // hand back row ids so the client can send ids next time
            let mut response = InsertResponse::default();
            for record in &batch {
                for fp in &record.fingerprints {
                    if let Some(id) = store.fingerprint_id(&fp.filename, &fp.checksums)? {
                        response
                            .fp_ids
                            .insert(wire::fp_cache_key(&fp.filename, &fp.checksums), id);
                    }
                }
            }
            Ok(response)
        },
    )
    .await
}

/// Expand id-carrying dependency entries into full records; an id the
/// store no longer knows makes the whole batch `stale_fp`.
fn resolve_batch(store: &mut LocalStore, request: InsertRequest) -> Result<Vec<TestRecord>> {
    let mut batch = Vec::with_capacity(request.tests.len());
    for (test_id, mut entry) in request.tests {
        for dep in &mut entry.deps {
            if dep.method_checksums.is_none() {
                let Some(id) = dep.fp_id else {
                    return Err(EzmonError::payload(format!(
                        "dependency on {} carries neither checksums nor id",
                        dep.filename
                    )));
                };
                let Some((filename, checksums)) = store.fingerprint_by_id(id)? else {
                    return Err(EzmonError::ServerStatus(
                        422,
                        format!("unknown fingerprint id {id}"),
                    ));
                };
                if filename != dep.filename {
                    return Err(EzmonError::ServerStatus(
                        422,
                        format!("fingerprint id {id} names {filename}, not {}", dep.filename),
                    ));
                }
                dep.method_checksums = Some(hex::encode(crate::fingerprint::pack_checksums(
                    &checksums,
                )));
            }
        }
        batch.push(entry.into_record(&test_id)?);
    }
    Ok(batch)
}

async fn changed(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(
        state,
        headers,
        body,
        |store, request: ChangedRequest| -> Result<ChangedResponse> {
            let changed = store.changed_files(&request.hashes)?;
            Ok(ChangedResponse {
                changed: changed.into_iter().collect(),
            })
        },
    )
    .await
}

async fn affected(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(state, headers, body, |store, request: AffectedRequest| {
        store.affected_tests(&request.current)
    })
    .await
}

async fn delete(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(
        state,
        headers,
        body,
        |store, request: DeleteRequest| -> Result<serde_json::Value> {
            store.delete_tests(&request.test_ids)?;
            Ok(serde_json::json!({}))
        },
    )
    .await
}

async fn meta_read(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(
        state,
        headers,
        body,
        |store, request: MetaReadRequest| -> Result<MetaReadResponse> {
            Ok(MetaReadResponse {
                value: store.read_meta(&request.key)?,
            })
        },
    )
    .await
}

async fn meta_write(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    with_session(
        state,
        headers,
        body,
        |store, request: MetaWriteRequest| -> Result<serde_json::Value> {
            store.write_meta(&request.key, &request.value)?;
            Ok(serde_json::json!({}))
        },
    )
    .await
}

async fn finish(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    let session_header = headers
        .get(wire::HDR_SESSION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let state_for_cleanup = state.clone();
    let response = with_session(
        state,
        headers,
        body,
        |store, request: FinishRequest| -> Result<serde_json::Value> {
            store.finish(&request.stats)?;
            Ok(serde_json::json!({}))
        },
    )
    .await;
    if response.status() == StatusCode::OK
        && let Some(id) = session_header
    {
        state_for_cleanup.inner.sessions.remove(&id);
    }
    response
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
