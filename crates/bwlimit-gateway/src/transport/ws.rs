//! WebSocket handler.
//!
//! Responsibilities:
//! - Upgrade HTTP -> WS
//! - Assign the `ConnectionId` (client-supplied `client_id` or a fresh UUID)
//! - Spawn the connection context and register it with the directory and
//!   the bandwidth manager
//! - Relay inbound Text/Binary frames to every other live session
//! - Lifecycle: ping/pong + idle timeout, then uninstall on close

use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Query, State},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::Instrument;

use bwlimit_core::error::{BwError, Result};

use crate::admin::ApiError;
use crate::app_state::AppState;
use crate::pipeline::frame_len;
use crate::session::{ConnectionContext, ConnectionId};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Human alias; used for policy alias keys and bypass.
    pub user: Option<String>,
    /// Stable id so a reconnecting client keeps its override.
    pub client_id: Option<String>,
}

fn sys_authed_json(conn_id: &ConnectionId, user: Option<&str>, shaped: bool) -> String {
    json!({
        "v": 1,
        "svc": "sys",
        "type": "authed",
        "flags": 0,
        "data": {
            "conn_id": conn_id.to_string(),
            "user": user,
            "shaped": shaped
        }
    })
    .to_string()
}

fn sys_error_json(code: &str, msg: &str) -> String {
    json!({
        "v": 1,
        "svc": "sys",
        "type": "error",
        "flags": 0,
        "data": {
            "code": code,
            "msg": msg
        }
    })
    .to_string()
}

fn connection_id(app: &AppState, q: &WsQuery) -> Result<ConnectionId> {
    let id = match q.client_id.as_deref() {
        Some(s) => s.parse::<ConnectionId>()?,
        None => ConnectionId::new_random(),
    };
    if app.directory().handle(&id).is_some() {
        return Err(BwError::InvalidArgument(format!("connection {id} is already live")));
    }
    Ok(id)
}

pub async fn ws_upgrade(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
) -> Response {
    if app.is_draining() {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    let conn_id = match connection_id(&app, &q) {
        Ok(id) => id,
        Err(e) => return ApiError(e).into_response(),
    };

    let span = tracing::info_span!("session", %conn_id, user = q.user.as_deref().unwrap_or("-"));
    ws.on_upgrade(move |socket| {
        async move {
            if let Err(e) = run_session(app, conn_id, q.user, socket).await {
                tracing::debug!(error = %e, "session ended with error");
            }
        }
        .instrument(span)
    })
}

async fn run_session(
    app: AppState,
    conn_id: ConnectionId,
    user: Option<String>,
    socket: WebSocket,
) -> Result<()> {
    let (ws_tx, mut ws_rx) = socket.split();
    let metrics = app.metrics();
    let directory = app.directory();
    let manager = app.manager();
    let bypass = app.is_bypass(user.as_deref());

    let (handle, mut ctx_task) =
        ConnectionContext::new(conn_id, ws_tx, Arc::clone(&metrics)).spawn();

    if let Err(e) = directory.insert(conn_id, user.clone(), handle.clone(), bypass) {
        let _ = handle.write(Message::Text(sys_error_json(e.kind().as_str(), &e.to_string())));
        handle.close();
        return Err(e);
    }
    metrics.sessions_active.inc(&[]);
    tracing::info!(bypass, "session opened");

    if let Err(e) = manager.on_connection_established(conn_id, handle.clone(), bypass) {
        tracing::warn!(error = %e, "session continues unshaped");
    }
    let _ = handle.write(Message::Text(sys_authed_json(&conn_id, user.as_deref(), !bypass)));

    let gw = &app.cfg().gateway;
    let ping_every = Duration::from_millis(gw.ping_interval_ms);
    let idle_timeout = Duration::from_millis(gw.idle_timeout_ms);

    let mut ping_tick = tokio::time::interval(ping_every);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            // context exited (socket write failed)
            _ = &mut ctx_task => break,

            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break; };
                last_activity = Instant::now();
                let _ = handle.record_read(frame_len(&msg));

                match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        let delivered = directory.broadcast_except(&conn_id, &msg);
                        tracing::trace!(delivered, "relayed");
                    }
                    Message::Ping(payload) => {
                        let _ = handle.write(Message::Pong(payload));
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }

            _ = ping_tick.tick() => {
                if handle.write(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if last_activity.elapsed() >= idle_timeout {
                    let _ = handle.write(Message::Text(sys_error_json("TIMEOUT", "idle timeout")));
                    break;
                }
            }
        }
    }

    handle.close();
    manager.on_connection_closed(&conn_id);
    directory.remove(&conn_id);
    metrics.sessions_active.dec(&[]);
    tracing::info!("session closed");
    Ok(())
}
