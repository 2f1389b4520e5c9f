//! HTTP API service implementations for `server`
//!
//! | Method | Path | Body |
//! |---|---|---|
//! | `GET` | `/health` | |
//! | `POST` | `/api/v1/tenants/{tenant}/snapshots` | `{"type": "manual", "label": "..."}` |
//! | `GET` | `/api/v1/tenants/{tenant}/snapshots?type=..&state=..` | |
//! | `GET` | `/api/v1/tenants/{tenant}/snapshots/{id}` | |
//! | `POST` | `/api/v1/tenants/{tenant}/restore` | `{"snapshot_id": 3}` or `{"timestamp": "<RFC 3339>"}` |
//! | `GET` | `/api/v1/tenants/{tenant}/restore` | |
//! | `DELETE` | `/api/v1/tenants/{tenant}/restore` | |
//! | `POST` | `/api/v1/tenants/{tenant}/undo` | `{"log_id": 7, "force": false}` |
//!
//! Errors are returned as `{"error": {"kind": "...", "message": "...", ...}}` where the extra
//! fields depend on the kind, e.g. the earliest restorable time of an out-of-range restore.

use std::{convert::Infallible, sync::Arc};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hyper::{
    Body, Method, Request, Response, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
};
use iox_time::Time;
use observability_deps::tracing::{debug, error, info};
use rewind_catalog::{SnapshotFilter, SnapshotType, TenantDirectory, TenantDirectoryError};
use rewind_id::{OperationLogId, SnapshotId, TenantId};
use rewind_oplog::{UndoEngine, UndoError, UndoOptions};
use rewind_restore::RestoreOrchestrator;
use rewind_snapshot::SnapshotManager;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Request bodies are small JSON documents
const MAX_REQUEST_BYTES: usize = 64 * 1024;

const TENANTS_PREFIX: &str = "/api/v1/tenants/";

#[derive(Debug, Error)]
pub enum Error {
    #[error("no route for {method} {path}")]
    NoRoute { method: Method, path: String },

    #[error("method {method} is not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String },

    #[error("invalid request body: {0}")]
    InvalidBody(serde_json::Error),

    #[error("invalid query string: {0}")]
    InvalidQuery(#[from] serde_urlencoded::de::Error),

    #[error("invalid snapshot id {0:?}")]
    InvalidSnapshotId(String),

    #[error("a restore needs exactly one of snapshot_id or timestamp")]
    InvalidRestoreTarget,

    #[error("invalid timestamp {value:?}, expected RFC 3339: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("request body exceeds {0} bytes")]
    RequestSizeExceeded(usize),

    #[error("client hung up while sending body: {0}")]
    ClientHangup(#[from] hyper::Error),

    #[error("serializing response: {0}")]
    SerializeResponse(serde_json::Error),

    #[error("tenant {0} has no failed restore to clear")]
    RestoreNotFailed(TenantId),

    #[error(transparent)]
    Directory(#[from] TenantDirectoryError),

    #[error(transparent)]
    Snapshot(#[from] rewind_snapshot::Error),

    #[error(transparent)]
    Restore(#[from] rewind_restore::Error),

    #[error(transparent)]
    Undo(#[from] UndoError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How an [`Error`] is presented to the client
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    /// Extra fields merged into the error object
    details: Vec<(&'static str, Value)>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str) -> Self {
        Self {
            status,
            kind,
            details: vec![],
        }
    }

    fn with(mut self, key: &'static str, value: impl Serialize) -> Self {
        self.details.push((key, json!(value)));
        self
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal")
    }
}

impl Error {
    fn api_error(&self) -> ApiError {
        use rewind_restore::Error as Restore;
        use rewind_snapshot::Error as Snapshot;

        match self {
            Self::NoRoute { .. } => ApiError::new(StatusCode::NOT_FOUND, "not_found"),
            Self::MethodNotAllowed { .. } => {
                ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
            }
            Self::InvalidBody(_)
            | Self::InvalidQuery(_)
            | Self::InvalidSnapshotId(_)
            | Self::InvalidRestoreTarget
            | Self::InvalidTimestamp { .. }
            | Self::ClientHangup(_) => ApiError::new(StatusCode::BAD_REQUEST, "invalid_request"),
            Self::RequestSizeExceeded(_) => {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "request_too_large")
            }
            Self::SerializeResponse(_) => ApiError::internal(),
            Self::RestoreNotFailed(_) => ApiError::new(StatusCode::CONFLICT, "restore_not_failed"),
            Self::Directory(TenantDirectoryError::NotFound(tenant_id)) => {
                ApiError::new(StatusCode::NOT_FOUND, "tenant_not_found").with("tenant", tenant_id)
            }
            Self::Directory(TenantDirectoryError::Unexpected(_)) => ApiError::internal(),

            Self::Snapshot(Snapshot::Busy { .. }) => {
                ApiError::new(StatusCode::CONFLICT, "snapshot_in_progress")
            }
            Self::Snapshot(Snapshot::TenantLocked(locked))
            | Self::Restore(Restore::TenantLocked(locked))
            | Self::Undo(UndoError::TenantLocked(locked)) => {
                ApiError::new(StatusCode::LOCKED, "tenant_locked").with("lock", &locked.state)
            }
            Self::Snapshot(Snapshot::CreationFailed { snapshot_id, .. }) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "snapshot_failed")
                    .with("snapshot_id", snapshot_id)
            }
            Self::Snapshot(Snapshot::NotFound { snapshot_id, .. })
            | Self::Restore(Restore::SnapshotNotFound { snapshot_id, .. }) => {
                ApiError::new(StatusCode::NOT_FOUND, "snapshot_not_found")
                    .with("snapshot_id", snapshot_id)
            }
            Self::Snapshot(
                Snapshot::WalPosition { .. } | Snapshot::Release { .. } | Snapshot::Catalog(_),
            ) => ApiError::internal(),

            Self::Restore(Restore::SnapshotNotRestorable { state, .. }) => {
                ApiError::new(StatusCode::CONFLICT, "snapshot_not_restorable")
                    .with("state", state)
            }
            Self::Restore(Restore::OutOfRange { earliest, .. }) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "restore_out_of_range")
                    .with("earliest", earliest.to_rfc3339())
            }
            Self::Restore(Restore::NothingRestorable { .. }) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "nothing_restorable")
            }
            Self::Restore(Restore::TargetInFuture { .. }) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "restore_target_in_future")
            }
            Self::Restore(Restore::Failed { event_id, .. }) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "restore_failed")
                    .with("event_id", event_id)
            }
            Self::Restore(Restore::TimedOut { event_id, .. }) => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "restore_timed_out")
                    .with("event_id", event_id)
            }
            Self::Restore(Restore::Directory(TenantDirectoryError::NotFound(tenant_id))) => {
                ApiError::new(StatusCode::NOT_FOUND, "tenant_not_found").with("tenant", tenant_id)
            }
            Self::Restore(Restore::Directory(_) | Restore::Catalog(_)) => ApiError::internal(),

            Self::Undo(UndoError::LogNotFound { log_id }) => {
                ApiError::new(StatusCode::NOT_FOUND, "operation_not_found").with("log_id", log_id)
            }
            Self::Undo(UndoError::AlreadyUndone {
                log_id,
                undone_at_ns,
            }) => ApiError::new(StatusCode::CONFLICT, "already_undone")
                .with("log_id", log_id)
                .with(
                    "undone_at",
                    undone_at_ns.map(|ns| Time::from_timestamp_nanos(ns).to_rfc3339()),
                ),
            Self::Undo(UndoError::Conflict { conflicts, .. }) => {
                ApiError::new(StatusCode::CONFLICT, "undo_conflict").with("conflicts", conflicts)
            }
            Self::Undo(UndoError::RecordMissing { model, id, .. }) => {
                ApiError::new(StatusCode::CONFLICT, "record_missing")
                    .with("model", model)
                    .with("record_id", id)
            }
            Self::Undo(UndoError::Schema(_)) => {
                ApiError::new(StatusCode::CONFLICT, "schema_mismatch")
            }
            Self::Undo(UndoError::MalformedLog { .. } | UndoError::Store(_)) => {
                ApiError::internal()
            }
        }
    }

    fn response(&self) -> Response<Body> {
        let ApiError {
            status,
            kind,
            details,
        } = self.api_error();
        let mut error = serde_json::Map::new();
        error.insert("kind".to_string(), Value::from(kind));
        error.insert("message".to_string(), Value::from(self.to_string()));
        for (key, value) in details {
            error.insert(key.to_string(), value);
        }
        let body = json!({ "error": error }).to_string();

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSnapshotRequest {
    #[serde(rename = "type")]
    snapshot_type: Option<SnapshotType>,
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestoreRequest {
    snapshot_id: Option<SnapshotId>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UndoRequest {
    log_id: OperationLogId,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct SnapshotList<T> {
    snapshots: Vec<T>,
}

#[derive(Debug)]
pub struct HttpApiArgs {
    pub snapshots: Arc<SnapshotManager>,
    pub restores: Arc<RestoreOrchestrator>,
    pub undo: Arc<UndoEngine>,
    pub directory: Arc<dyn TenantDirectory>,
}

#[derive(Debug)]
pub struct HttpApi {
    snapshots: Arc<SnapshotManager>,
    restores: Arc<RestoreOrchestrator>,
    undo: Arc<UndoEngine>,
    directory: Arc<dyn TenantDirectory>,
}

impl HttpApi {
    pub fn new(
        HttpApiArgs {
            snapshots,
            restores,
            undo,
            directory,
        }: HttpApiArgs,
    ) -> Self {
        Self {
            snapshots,
            restores,
            undo,
            directory,
        }
    }

    async fn create_snapshot(&self, tenant_id: &TenantId, req: Request<Body>) -> Result<Response<Body>> {
        let body = read_body(req).await?;
        let request: CreateSnapshotRequest = if body.is_empty() {
            CreateSnapshotRequest {
                snapshot_type: None,
                label: None,
            }
        } else {
            serde_json::from_slice(&body).map_err(Error::InvalidBody)?
        };
        let snapshot = self
            .snapshots
            .create_snapshot(
                tenant_id,
                request.snapshot_type.unwrap_or(SnapshotType::Manual),
                request.label,
            )
            .await?;
        json_response(StatusCode::CREATED, &snapshot)
    }

    fn list_snapshots(&self, tenant_id: &TenantId, req: &Request<Body>) -> Result<Response<Body>> {
        let filter: SnapshotFilter = serde_urlencoded::from_str(req.uri().query().unwrap_or(""))?;
        let snapshots = self.snapshots.list_snapshots(tenant_id, filter);
        json_response(StatusCode::OK, &SnapshotList { snapshots })
    }

    fn get_snapshot(&self, tenant_id: &TenantId, id: &str) -> Result<Response<Body>> {
        let snapshot_id = id
            .parse::<SnapshotId>()
            .map_err(|_| Error::InvalidSnapshotId(id.to_string()))?;
        let snapshot = self.snapshots.get_snapshot(tenant_id, snapshot_id)?;
        json_response(StatusCode::OK, &snapshot)
    }

    async fn restore(&self, tenant_id: &TenantId, req: Request<Body>) -> Result<Response<Body>> {
        let body = read_body(req).await?;
        let request: RestoreRequest = serde_json::from_slice(&body).map_err(Error::InvalidBody)?;
        let event = match (request.snapshot_id, request.timestamp) {
            (Some(snapshot_id), None) => {
                self.restores
                    .restore_to_snapshot(tenant_id, snapshot_id)
                    .await?
            }
            (None, Some(timestamp)) => {
                let parsed = DateTime::parse_from_rfc3339(&timestamp).map_err(|source| {
                    Error::InvalidTimestamp {
                        value: timestamp.clone(),
                        source,
                    }
                })?;
                self.restores
                    .restore_to_timestamp(tenant_id, Time::from_datetime(parsed.with_timezone(&Utc)))
                    .await?
            }
            _ => return Err(Error::InvalidRestoreTarget),
        };
        json_response(StatusCode::OK, &event)
    }

    fn restore_status(&self, tenant_id: &TenantId) -> Result<Response<Body>> {
        json_response(StatusCode::OK, &self.restores.status(tenant_id))
    }

    /// Operator acknowledgement of a failed restore; unlocks the tenant
    async fn clear_failed_restore(&self, tenant_id: &TenantId) -> Result<Response<Body>> {
        if !self.restores.clear_failed(tenant_id).await? {
            return Err(Error::RestoreNotFailed(tenant_id.clone()));
        }
        info!(tenant = %tenant_id, "failed restore cleared via API");
        self.restore_status(tenant_id)
    }

    async fn undo(&self, tenant_id: &TenantId, req: Request<Body>) -> Result<Response<Body>> {
        let body = read_body(req).await?;
        let request: UndoRequest = serde_json::from_slice(&body).map_err(Error::InvalidBody)?;
        let report = self
            .undo
            .undo(tenant_id, request.log_id, UndoOptions {
                force: request.force,
            })
            .await?;
        info!(
            tenant = %tenant_id,
            log_id = %request.log_id,
            force = request.force,
            "operation undone via API"
        );
        json_response(StatusCode::OK, &report)
    }
}

pub(crate) async fn route_request(
    http_server: Arc<HttpApi>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    debug!(%method, %uri, "processing request");

    match perform_routing(&http_server, req).await {
        Ok(response) => {
            debug!(status = %response.status(), "successfully processed request");
            Ok(response)
        }
        Err(error) => {
            let response = error.response();
            if response.status().is_server_error() {
                error!(%error, %method, %uri, "error while handling request");
            } else {
                debug!(%error, %method, %uri, "error while handling request");
            }
            Ok(response)
        }
    }
}

async fn perform_routing(http_server: &HttpApi, req: Request<Body>) -> Result<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == "/health" {
        return match method {
            Method::GET => Ok(Response::new(Body::from("OK"))),
            _ => Err(Error::MethodNotAllowed { method, path }),
        };
    }

    let Some((tenant_id, rest)) = tenant_route(&path) else {
        return Err(Error::NoRoute { method, path });
    };
    let segments = rest.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
    let known = matches!(
        segments.as_slice(),
        ["snapshots"] | ["snapshots", _] | ["restore"] | ["undo"]
    );
    if !known {
        return Err(Error::NoRoute {
            method,
            path: path.clone(),
        });
    }

    // 404 for tenants the platform does not know about
    http_server.directory.get(&tenant_id).await?;

    match (&method, segments.as_slice()) {
        (&Method::POST, ["snapshots"]) => http_server.create_snapshot(&tenant_id, req).await,
        (&Method::GET, ["snapshots"]) => http_server.list_snapshots(&tenant_id, &req),
        (&Method::GET, ["snapshots", id]) => http_server.get_snapshot(&tenant_id, id),
        (&Method::POST, ["restore"]) => http_server.restore(&tenant_id, req).await,
        (&Method::GET, ["restore"]) => http_server.restore_status(&tenant_id),
        (&Method::DELETE, ["restore"]) => http_server.clear_failed_restore(&tenant_id).await,
        (&Method::POST, ["undo"]) => http_server.undo(&tenant_id, req).await,
        _ => Err(Error::MethodNotAllowed {
            method: method.clone(),
            path: path.clone(),
        }),
    }
}

/// Split `/api/v1/tenants/{tenant}/rest` into the tenant and `rest`
fn tenant_route(path: &str) -> Option<(TenantId, &str)> {
    let rest = path.strip_prefix(TENANTS_PREFIX)?;
    let (tenant, rest) = rest.split_once('/').unwrap_or((rest, ""));
    if tenant.is_empty() {
        return None;
    }
    Some((TenantId::from(tenant), rest))
}

async fn read_body(req: Request<Body>) -> Result<Bytes> {
    let mut payload = req.into_body();
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > MAX_REQUEST_BYTES {
            return Err(Error::RequestSizeExceeded(MAX_REQUEST_BYTES));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Result<Response<Body>> {
    let body = serde_json::to_vec(body).map_err(Error::SerializeResponse)?;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}
