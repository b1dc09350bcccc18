//! Local receiver for push subscription deliveries.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use colored::Colorize;
use sailhouse::{PushSubscriptionPayload, PushSubscriptionVerifier, PUSH_SIGNATURE_HEADER};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

struct WebhookState {
    verifier: PushSubscriptionVerifier,
}

fn app(verifier: PushSubscriptionVerifier) -> Router {
    Router::new()
        .route("/webhook", post(receive))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(WebhookState { verifier }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Verify the signature header, then decode and print the delivery.
async fn receive(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let header = headers
        .get(PUSH_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Err(err) = state.verifier.verify_signature(header, &body, None) {
        tracing::warn!(code = %err.code, "rejected push delivery");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": err.message, "code": err.code.as_str() })),
        );
    }

    let payload: PushSubscriptionPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid payload: {}", e) })),
            )
        }
    };

    println!(
        "{} {} {}",
        "received".green().bold(),
        payload.id.cyan(),
        payload.data
    );
    (StatusCode::OK, Json(json!({ "received": payload.id })))
}

/// Serve until `shutdown` fires.
pub async fn serve(secret: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
    let verifier =
        PushSubscriptionVerifier::new(secret).context("cannot verify deliveries without a secret")?;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    println!(
        "{} POST http://{}/webhook",
        "Listening for push deliveries on".bold(),
        listener.local_addr()?
    );

    axum::serve(listener, app(verifier))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("webhook server failed")
}
