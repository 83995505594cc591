//! Dispatcher HTTP surface: the enqueue hint and health.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

use uniscan_proto::internal::{
    DispatcherHealth, EnqueueReply, EnqueueRequest, INTERNAL_TOKEN_HEADER,
};

use crate::scheduler::Scheduler;

#[derive(Clone)]
struct HttpState {
    scheduler: Scheduler,
    internal_token: Option<Arc<str>>,
}

pub fn router(scheduler: Scheduler, internal_token: Option<String>) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/health", get(health))
        .with_state(HttpState {
            scheduler,
            internal_token: internal_token.map(Arc::from),
        })
}

async fn enqueue(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Response {
    if let Some(expected) = &state.internal_token {
        let presented = headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_ref()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response();
        }
    }

    let queued = state.scheduler.enqueue(&req.delivery_ids).await;
    debug!(hinted = req.delivery_ids.len(), queued, "Enqueue hint handled");
    Json(EnqueueReply { ok: true, queued }).into_response()
}

async fn health(State(state): State<HttpState>) -> Json<DispatcherHealth> {
    Json(DispatcherHealth {
        ok: true,
        service_id: state.scheduler.instance_id().to_string(),
        ts: uniscan_proto::now_iso(),
        in_flight: state.scheduler.in_flight(),
    })
}
