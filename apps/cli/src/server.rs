//! Webhook trigger: `POST /webhook` runs one batch, `GET /health` answers ok.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::{Result, eyre};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use chartdoc_core::SilentProgress;
use chartdoc_shared::{AppConfig, BatchRequest, Mode};

use crate::commands::build_orchestrator;

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    /// Batches run one at a time; the ledger assumes a single writer.
    gate: Arc<Mutex<()>>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .with_state(state)
}

pub(crate) async fn serve(config: AppConfig, host: &str, port: u16) -> Result<()> {
    let state = AppState {
        config: Arc::new(config),
        gate: Arc::new(Mutex::new(())),
    };
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| eyre!("cannot bind {addr}: {e}"))?;

    info!(%addr, "webhook listening");
    println!("Listening on http://{addr} (POST /webhook, GET /health)");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| eyre!("server error: {e}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn validate(request: &BatchRequest) -> std::result::Result<(), String> {
    if request.article_ids.iter().all(|id| id.trim().is_empty()) {
        return Err("article_ids must contain at least one id".into());
    }
    if request.mode != Mode::ConfirmSubset && !request.confirm.is_empty() {
        return Err("confirm only applies to mode confirm-subset".into());
    }
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

#[instrument(skip_all)]
async fn webhook(State(state): State<AppState>, Json(request): Json<BatchRequest>) -> Response {
    info!(mode = %request.mode, articles = request.article_ids.len(), "webhook received");
    if let Err(message) = validate(&request) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let _guard = state.gate.lock().await;
    let orchestrator = match build_orchestrator(&state.config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "batch setup failed");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, format!("setup failed: {e}"));
        }
    };

    let report = orchestrator.run_batch(&request, &SilentProgress).await;
    Json(report).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> BatchRequest {
        serde_json::from_str(json).expect("request")
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(validate(&request(r#"{"article_ids": []}"#)).is_err());
        assert!(validate(&request(r#"{"article_ids": [" "]}"#)).is_err());
    }

    #[test]
    fn confirm_requires_confirm_subset() {
        let bad = request(r#"{"article_ids": ["42"], "mode": "apply", "confirm": ["Capacity"]}"#);
        assert!(validate(&bad).is_err());
        let good =
            request(r#"{"article_ids": ["42"], "mode": "confirm-subset", "confirm": ["Capacity"]}"#);
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn front_end_mode_names_are_accepted() {
        let req = request(r#"{"article_ids": ["42"], "mode": "update-preview"}"#);
        assert_eq!(req.mode, Mode::Preview);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
