//! Axum adapter for [`WebhookGateway`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::gateway::WebhookGateway;

/// Router serving the gateway at `POST /webhook`.
pub fn router(gateway: Arc<WebhookGateway>) -> Router {
    router_at("/webhook", gateway)
}

/// Router serving the gateway at `POST {path}`.
pub fn router_at(path: &str, gateway: Arc<WebhookGateway>) -> Router {
    Router::new()
        .route(path, post(receive_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn receive_webhook(
    State(gateway): State<Arc<WebhookGateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(gateway.signature_header())
        .and_then(|v| v.to_str().ok());

    let outcome = gateway.handle(&body, signature).await;
    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (status, Json(outcome.body())).into_response()
}
