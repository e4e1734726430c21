//! Query Routes
//!
//! Routes:
//! - POST /query - Answer a question from stored email

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::services::QueryResponse;
use crate::{AppState, Error, Result};

/// Largest number of threads a single question may ask for.
pub const MAX_TOP_K: usize = 100;

/// Build query routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/query", post(query_emails))
}

/// Question answering request.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,

    /// Number of threads to answer from
    pub top_k: Option<usize>,
}

/// Answer a question with citations.
async fn query_emails(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(Error::Validation("Question cannot be empty".to_string()));
    }

    info!(question, "Received query");
    let top_k = request
        .top_k
        .unwrap_or(state.default_top_k)
        .clamp(1, MAX_TOP_K);
    let response = state.query.query(question, top_k).await?;

    Ok(Json(response))
}
