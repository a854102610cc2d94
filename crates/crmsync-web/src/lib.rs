//! Axum webhook surface: the CRM posts a form-encoded callback when a deal
//! changes, and the handler runs the single-record sync path.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crmsync_pipeline::{SingleSyncError, SyncPipeline};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "crmsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync-callback", post(sync_callback_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// The callback payload nests the record ID under `data[FIELDS][ID]`; a
/// plain `id` field is accepted for manual invocations.
fn deal_id_from_form(form: &HashMap<String, String>) -> Option<&str> {
    form.get("data[FIELDS][ID]")
        .or_else(|| form.get("id"))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

async fn sync_callback_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(deal_id) = deal_id_from_form(&form) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing deal id in callback payload"})),
        )
            .into_response();
    };

    match state.pipeline.sync_one(deal_id).await {
        Ok(id) => (StatusCode::OK, Json(json!({"status": "ok", "id": id}))).into_response(),
        Err(err) => {
            warn!(deal_id, error = %err, "webhook sync failed");
            // Upstream failures (missing record, exhausted fetch) are the
            // source's fault; only transform/persistence problems are ours.
            let status = match &err {
                SingleSyncError::NotFound { .. } | SingleSyncError::Api(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"error": err.to_string()}))).into_response()
        }
    }
}

async fn healthz_handler() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}
