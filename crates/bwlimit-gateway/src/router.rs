//! Axum router wiring.
//!
//! - `/v1/ws` WebSocket upgrade
//! - `/healthz`, `/readyz`, `/metrics`
//! - `/admin/...` when `admin.enabled`

use axum::{routing::get, Router};

use crate::{admin, app_state::AppState, ops, transport};

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/ws", get(transport::ws::ws_upgrade))
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics));
    if state.cfg().admin.enabled {
        router = router.merge(admin::routes());
    }
    router.with_state(state)
}
