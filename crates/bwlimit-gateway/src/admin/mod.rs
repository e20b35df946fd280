//! Administrative HTTP surface.
//!
//! Each route maps onto one bandwidth-manager or policy operation. Keys in
//! paths are either a connection UUID or the alias of a live session.
//! Limits are accepted as `limit_bps` or `limit_kbps` (1 KiB = 1024 bytes).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use bwlimit_core::error::{BwError, ErrorKind, Result};
use bwlimit_core::BandwidthLimit;

use crate::app_state::AppState;
use crate::bandwidth::{BulkOutcome, ConnectionInfo};
use crate::policy::AliasResolver;
use crate::session::ConnectionId;

/// `BwError` rendered as an HTTP error with a `{ code, msg }` body.
#[derive(Debug)]
pub struct ApiError(pub BwError);

impl From<BwError> for ApiError {
    fn from(e: BwError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::InvalidArgument | ErrorKind::BadConfig | ErrorKind::UnsupportedVersion => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::ConnectionUnavailable => StatusCode::CONFLICT,
            ErrorKind::PersistenceFailed | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "code": kind.as_str(), "msg": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitBody {
    pub limit_bps: Option<u64>,
    pub limit_kbps: Option<u64>,
}

impl LimitBody {
    pub fn into_limit(self) -> Result<BandwidthLimit> {
        match (self.limit_bps, self.limit_kbps) {
            (Some(bps), None) => BandwidthLimit::from_bps(bps),
            (None, Some(kbps)) => BandwidthLimit::from_kbps(kbps),
            _ => Err(BwError::InvalidArgument(
                "exactly one of limit_bps or limit_kbps is required".into(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectionView {
    #[serde(flatten)]
    pub info: ConnectionInfo,
    pub limit_kbps: f64,
    pub alias: Option<String>,
    pub override_bps: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LimitView {
    pub limit_bps: u64,
    pub limit_kbps: f64,
}

impl From<BandwidthLimit> for LimitView {
    fn from(l: BandwidthLimit) -> Self {
        Self {
            limit_bps: l.bytes_per_sec(),
            limit_kbps: l.kbps(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectionList {
    pub default_limit_bps: u64,
    pub connections: Vec<ConnectionView>,
}

#[derive(Debug, Serialize)]
pub struct ClearedView {
    pub conn_id: ConnectionId,
    pub removed: bool,
    pub limit_bps: u64,
}

#[derive(Debug, Serialize)]
pub struct DefaultUpdate {
    #[serde(flatten)]
    pub limit: LimitView,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

#[derive(Debug, Serialize)]
pub struct ReloadView {
    #[serde(flatten)]
    pub outcome: BulkOutcome,
    pub default_limit_bps: u64,
    pub overrides: usize,
    pub unresolved_aliases: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/overrides/:key", put(put_override).delete(delete_override))
        .route("/admin/default", get(get_default).put(put_default))
        .route("/admin/connections", get(list_connections))
        .route("/admin/connections/:key", get(get_connection))
        .route("/admin/reload", post(reload))
}

/// UUID text, or the alias of a live session.
fn resolve_key(app: &AppState, key: &str) -> Result<ConnectionId> {
    if let Ok(id) = key.parse::<ConnectionId>() {
        return Ok(id);
    }
    app.directory()
        .resolve_alias(key)
        .ok_or_else(|| BwError::NotFound(format!("no active connection for '{key}'")))
}

fn view(app: &AppState, id: &ConnectionId) -> ConnectionView {
    let info = app.manager().info(id);
    let limit_kbps = info.limit_bps as f64 / bwlimit_core::limit::BYTES_PER_KIB as f64;
    ConnectionView {
        limit_kbps,
        alias: app.directory().get(id).and_then(|s| s.alias),
        override_bps: app.policy().get(id).map(|l| l.bytes_per_sec()),
        info,
    }
}

async fn put_override(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<LimitBody>,
) -> ApiResult<ConnectionView> {
    let limit = body.into_limit()?;
    let id = resolve_key(&app, &key)?;
    app.manager().set_override(id, limit)?;
    Ok(Json(view(&app, &id)))
}

async fn delete_override(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<ClearedView> {
    let id = resolve_key(&app, &key)?;
    let removed = app.manager().clear_override(&id)?;
    Ok(Json(ClearedView {
        conn_id: id,
        removed,
        limit_bps: app.manager().effective_limit(&id).bytes_per_sec(),
    }))
}

async fn get_default(State(app): State<AppState>) -> Json<LimitView> {
    Json(app.policy().get_default().into())
}

async fn put_default(
    State(app): State<AppState>,
    Json(body): Json<LimitBody>,
) -> ApiResult<DefaultUpdate> {
    let limit = body.into_limit()?;
    let outcome = app.manager().set_default(limit)?;
    Ok(Json(DefaultUpdate {
        limit: limit.into(),
        outcome,
    }))
}

async fn get_connection(
    State(app): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<ConnectionView> {
    let id = resolve_key(&app, &key)?;
    if !app.manager().is_active(&id) && app.policy().get(&id).is_none() {
        return Err(BwError::NotFound(format!("unknown connection {id}")).into());
    }
    Ok(Json(view(&app, &id)))
}

async fn list_connections(State(app): State<AppState>) -> Json<ConnectionList> {
    let connections = app
        .manager()
        .list()
        .into_iter()
        .map(|info| view(&app, &info.conn_id))
        .collect();
    Json(ConnectionList {
        default_limit_bps: app.policy().get_default().bytes_per_sec(),
        connections,
    })
}

async fn reload(State(app): State<AppState>) -> ApiResult<ReloadView> {
    let outcome = app.reload_policy()?;
    let policy = app.policy();
    Ok(Json(ReloadView {
        outcome,
        default_limit_bps: policy.get_default().bytes_per_sec(),
        overrides: policy.overrides().len(),
        unresolved_aliases: policy.unresolved_aliases().into_keys().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(bps: Option<u64>, kbps: Option<u64>) -> LimitBody {
        LimitBody {
            limit_bps: bps,
            limit_kbps: kbps,
        }
    }

    #[test]
    fn limit_body_accepts_exactly_one_unit() {
        assert_eq!(body(Some(4096), None).into_limit().unwrap().bytes_per_sec(), 4096);
        assert_eq!(body(None, Some(4)).into_limit().unwrap().bytes_per_sec(), 4096);
        assert!(body(None, None).into_limit().is_err());
        assert!(body(Some(1), Some(1)).into_limit().is_err());
        assert_eq!(
            body(Some(0), None).into_limit().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn error_status_mapping() {
        let status = |e: BwError| ApiError(e).into_response().status();
        assert_eq!(status(BwError::InvalidArgument("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(BwError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(BwError::Persistence("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(BwError::ConnectionUnavailable("x".into())), StatusCode::CONFLICT);
    }
}
