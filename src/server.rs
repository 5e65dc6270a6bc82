//! HTTP trigger for batch runs and read access to triage records.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::mailbox::Mailbox;
use crate::pipeline::TriageOrchestrator;

const DEFAULT_RECORD_LIMIT: usize = 50;
const MAX_RECORD_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TriageOrchestrator>,
    pub mailbox: Arc<dyn Mailbox>,
}

/// Build the router for the triage service.
pub fn triage_routes(orchestrator: Arc<TriageOrchestrator>, mailbox: Arc<dyn Mailbox>) -> Router {
    let state = AppState {
        orchestrator,
        mailbox,
    };

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/process-emails", post(process_emails))
        .route("/process-emails/cancel", post(cancel_batch))
        .route("/api/records", get(list_records))
        .route("/api/records/{email_id}/reprocess", post(reprocess_record))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "message": message.into(),
        })),
    )
        .into_response()
}

// ── Info & health ───────────────────────────────────────────────────

async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "mail-triage",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "POST /process-emails",
            "POST /process-emails/cancel",
            "GET /api/records?limit=N",
            "POST /api/records/{email_id}/reprocess",
        ],
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.orchestrator.store().ping().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "service": "mail-triage",
            "batch_running": state.orchestrator.is_running(),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "audit store unreachable")
        }
    }
}

// ── Batch trigger ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ProcessRequest {
    since: Option<DateTime<Utc>>,
    lookback_days: Option<u32>,
}

async fn process_emails(
    State(state): State<AppState>,
    body: Option<Json<ProcessRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let AppState {
        orchestrator,
        mailbox,
    } = state;

    // The batch runs on its own task so a dropped connection cannot cut it short.
    let run = tokio::spawn(async move {
        let mailbox = mailbox.as_ref();
        match (request.since, request.lookback_days) {
            (Some(since), _) => orchestrator.run_since(mailbox, since).await,
            (None, Some(days)) => {
                let lookback = std::time::Duration::from_secs(u64::from(days) * 24 * 3600);
                orchestrator.run_lookback(mailbox, Some(lookback)).await
            }
            (None, None) => orchestrator.run_lookback(mailbox, None).await,
        }
    });

    let result = match run.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Batch task did not complete");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "batch task did not complete");
        }
    };

    match result {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(PipelineError::BatchInProgress) => {
            error_body(StatusCode::CONFLICT, "a batch is already running")
        }
        Err(e) => {
            error!(error = %e, "Batch run failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn cancel_batch(State(state): State<AppState>) -> Response {
    if !state.orchestrator.is_running() {
        return error_body(StatusCode::CONFLICT, "no batch is running");
    }
    state.orchestrator.cancel();
    info!("Batch cancellation requested over HTTP");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "cancelling"})),
    )
        .into_response()
}

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReprocessRequest {
    reason: String,
}

/// Recompute a stored record from the mailbox copy of its email.
async fn reprocess_record(
    State(state): State<AppState>,
    Path(email_id): Path<String>,
    Json(request): Json<ReprocessRequest>,
) -> Response {
    let reason = request.reason.trim().to_string();
    if reason.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "a reason is required");
    }

    let AppState {
        orchestrator,
        mailbox,
    } = state;
    let id = email_id.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .reprocess_from_mailbox(mailbox.as_ref(), &id, &reason)
            .await
    });

    match run.await {
        Ok(Ok(record)) => Json(record).into_response(),
        Ok(Err(e @ (PipelineError::RecordNotFound(_) | PipelineError::EmailUnavailable(_)))) => {
            error_body(StatusCode::NOT_FOUND, e.to_string())
        }
        Ok(Err(e)) => {
            error!(email_id = %email_id, error = %e, "Reprocessing failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!(email_id = %email_id, error = %e, "Reprocess task did not complete");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "reprocess task did not complete")
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    limit: Option<usize>,
}

async fn list_records(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECORD_LIMIT)
        .min(MAX_RECORD_LIMIT);
    match state.orchestrator.store().list_recent(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list triage records");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to load records")
        }
    }
}
