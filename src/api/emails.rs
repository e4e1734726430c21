//! Email Routes
//!
//! Routes:
//! - GET /emails - List stored emails, newest first
//! - GET /emails/:id - Get one email with its analysis

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::{Email, EmailSummary};
use crate::{db, AppState, Error, Result};

/// Build email routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/emails", get(list_emails))
        .route("/emails/:id", get(get_email))
}

#[derive(Debug, Deserialize)]
pub struct ListEmailsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailListResponse {
    pub emails: Vec<EmailSummary>,
    /// Number of emails in this page
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailDetailResponse {
    pub email: Email,
    /// Stored LLM analysis, when the email has been processed
    pub analysis: Option<Value>,
}

async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<ListEmailsQuery>,
) -> Result<Json<EmailListResponse>> {
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);

    let emails: Vec<EmailSummary> = db::list_emails(&state.db, limit, offset)
        .await?
        .iter()
        .map(EmailSummary::from)
        .collect();

    Ok(Json(EmailListResponse {
        count: emails.len(),
        emails,
    }))
}

async fn get_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EmailDetailResponse>> {
    let email = db::get_email_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| Error::NotFound("Email not found".to_string()))?;

    let analysis = match state.store.get_metadata(&id).await {
        Ok(metadata) => metadata.and_then(|mut m| m.remove("analysis")),
        Err(e) => {
            warn!(email_id = %id, error = %e, "Could not load analysis");
            None
        }
    };

    Ok(Json(EmailDetailResponse { email, analysis }))
}
