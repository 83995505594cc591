//! HTTP surface: WebSocket upgrade, health and the internal dispatch hook.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use uniscan_proto::internal::{DispatchRequest, GatewayHealth};

use super::Gateway;
use super::ws::ws_handler;
use crate::notifier::INTERNAL_TOKEN_HEADER;

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/sendReq", get(ws_handler))
        .route("/health", get(health))
        .route("/internal/dispatch", post(internal_dispatch))
        .with_state(gateway)
}

async fn health(State(gateway): State<Gateway>) -> Json<GatewayHealth> {
    Json(GatewayHealth {
        ok: true,
        ts: uniscan_proto::now_iso(),
        scanners: gateway.connections().scanner_count().await,
        agents: gateway.connections().agent_count().await,
    })
}

async fn internal_dispatch(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Json(req): Json<DispatchRequest>,
) -> Response {
    let token = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !gateway.authorize_internal(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    match gateway.trigger_dispatch(&req.delivery_id).await {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::OK);
            (status, Json(outcome.to_reply(&req.delivery_id))).into_response()
        }
        Err(e) => {
            error!(delivery_id = %req.delivery_id, error = %e, "Dispatch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
