//! API Routes for mailrag
//!
//! This module combines all API routes into a single router.

mod emails;
mod ingest;
mod query;
pub mod status;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use emails::{EmailDetailResponse, EmailListResponse};
pub use ingest::ProcessRequest;
pub use query::{QueryRequest, MAX_TOP_K};

pub const API_VERSION: &str = "1.0.0";

/// Build the API routes.
///
/// Route structure:
/// - / - API description
/// - /query - Question answering
/// - /emails, /emails/:id - Stored email access
/// - /process - Date-range ingestion
/// - /health - Health check
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .merge(query::routes())
        .merge(emails::routes())
        .merge(ingest::routes())
        .merge(status::routes())
}

/// The complete application: routes, tracing and CORS bound to `state`.
pub fn router(state: AppState) -> Router {
    routes()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Email RAG API",
        "version": API_VERSION,
        "endpoints": {
            "query": "/query (POST)",
            "emails": "/emails (GET)",
            "email_by_id": "/emails/{id} (GET)",
            "process": "/process (POST)",
            "health": "/health (GET)"
        }
    }))
}
