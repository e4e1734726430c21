//! Ingestion Routes
//!
//! Routes:
//! - POST /process - Fetch, store and process emails for a date range

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::services::{IngestOutcome, LogProgress};
use crate::{AppState, Result};

/// Build ingestion routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/process", post(process_emails))
}

/// Date range to ingest, as `YYYY-MM-DD` or ISO-8601 timestamps.
#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub start_date: String,
    pub end_date: String,
}

async fn process_emails(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<IngestOutcome>> {
    info!(start = %request.start_date, end = %request.end_date, "Processing emails");

    let outcome = state
        .ingest
        .process_emails(&request.start_date, &request.end_date, &LogProgress)
        .await?;

    Ok(Json(outcome))
}
