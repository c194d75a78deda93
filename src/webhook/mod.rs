//! Webhook ingress: the HTTP endpoint the provider pushes delivery-status
//! callbacks to.
//!
//! The handler accepts JSON or form-encoded payloads and always answers
//! 200, including on malformed payloads and internal failures, which are
//! logged and swallowed so a broken handler cannot provoke provider-side
//! retry storms.

pub mod reconciler;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{error, info, warn};

use self::reconciler::{Reconciler, WebhookPayload};

/// Errors from running the ingress server.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Could not bind the listen address.
    #[error("failed to bind webhook listener on {addr}: {source}")]
    Bind {
        /// The requested listen address.
        addr: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The server exited with an error.
    #[error("webhook server error: {0}")]
    Serve(std::io::Error),
}

/// Shared state for the ingress handlers.
#[derive(Clone)]
struct IngressState {
    reconciler: Arc<Reconciler>,
}

/// Build the ingress router.
///
/// Routes:
/// - `POST /webhooks/provider`: delivery-status and inbound callbacks
/// - `GET /health`: unauthenticated liveness probe
pub fn router(reconciler: Arc<Reconciler>) -> Router {
    Router::new()
        .route("/webhooks/provider", post(receive_webhook))
        .route("/health", get(health))
        .with_state(IngressState { reconciler })
}

/// Run the ingress server until shutdown.
///
/// In-flight requests complete before the listener closes.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    host: &str,
    port: u16,
    reconciler: Arc<Reconciler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), WebhookError> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| WebhookError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "webhook ingress listening");

    axum::serve(listener, router(reconciler))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(WebhookError::Serve)?;

    info!("webhook ingress stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Accept a provider callback in JSON or form encoding.
///
/// Always 200: malformed payloads and processing failures are logged and
/// acknowledged.
async fn receive_webhook(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    let payload = match parse_payload(&headers, &body) {
        Ok(payload) => payload,
        Err(detail) => {
            warn!(detail, "malformed webhook payload discarded");
            return Json(serde_json::json!({ "status": "discarded" }));
        }
    };

    match state.reconciler.reconcile(payload).await {
        Ok(outcome) => Json(serde_json::json!({ "status": outcome.as_str() })),
        Err(e) => {
            // Logged and swallowed; the provider must still see success.
            error!(error = %e, "webhook reconciliation failed");
            Json(serde_json::json!({ "status": "error" }))
        }
    }
}

fn parse_payload(headers: &HeaderMap, body: &Bytes) -> Result<WebhookPayload, String> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.contains("json") {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    } else {
        serde_urlencoded::from_bytes(body).map_err(|e| e.to_string())
    }
}
