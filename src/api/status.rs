//! Status Routes
//!
//! Routes:
//! - GET /health - Health of SQLite, the vector store and the LLM

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::{self, LAST_SYNC_AT, LAST_SYNC_END, LAST_SYNC_START};
use crate::AppState;

/// Build status routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub services: ServicesHealth,
    pub last_sync: Option<LastSync>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServicesHealth {
    pub sqlite: ServiceCheck,
    pub vector_store: ServiceCheck,
    pub llm: ServiceCheck,
}

/// Outcome of checking one dependency.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServiceCheck {
    /// `ok`, `error` or `not_configured`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last failure seen by the service since its last success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
}

impl ServiceCheck {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            ..Default::default()
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    fn is_failed(&self) -> bool {
        self.status == "error"
    }
}

/// Window of the last successful ingestion.
#[derive(Debug, Serialize, Deserialize)]
pub struct LastSync {
    pub start: Option<String>,
    pub end: Option<String>,
    pub at: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Check every dependency. Any failing check marks the service degraded.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (sqlite, vector_store, llm) = futures::join!(
        check_sqlite(&state),
        check_vector_store(&state),
        check_llm(&state)
    );

    let status = if sqlite.is_failed() || vector_store.is_failed() || llm.is_failed() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    Json(HealthResponse {
        status,
        services: ServicesHealth {
            sqlite,
            vector_store,
            llm,
        },
        last_sync: last_sync(&state).await,
    })
}

async fn check_sqlite(state: &AppState) -> ServiceCheck {
    match db::get_email_count(&state.db).await {
        Ok(count) => ServiceCheck {
            email_count: Some(count),
            ..ServiceCheck::ok()
        },
        Err(e) => ServiceCheck::failed(e),
    }
}

async fn check_vector_store(state: &AppState) -> ServiceCheck {
    match state.store.count().await {
        Ok(count) => ServiceCheck {
            document_count: Some(count),
            ..ServiceCheck::ok()
        },
        Err(e) => ServiceCheck::failed(e),
    }
}

async fn check_llm(state: &AppState) -> ServiceCheck {
    if !state.llm.has_providers() {
        return ServiceCheck {
            status: "not_configured".to_string(),
            ..Default::default()
        };
    }

    let providers = Some(state.llm.providers());
    let check = if !state.llm.is_available().await {
        ServiceCheck::failed("LLM unavailable after repeated failures")
    } else if state.llm.check_connection().await {
        ServiceCheck::ok()
    } else {
        ServiceCheck::failed("No LLM provider reachable")
    };

    let (last_error, error_count) = match state.llm.get_error_info().await {
        Some((message, count)) => (Some(message), Some(count)),
        None => (None, None),
    };

    ServiceCheck {
        providers,
        last_error,
        error_count,
        ..check
    }
}

async fn last_sync(state: &AppState) -> Option<LastSync> {
    let sync = LastSync {
        start: db::get_metadata_value(&state.db, LAST_SYNC_START).await.ok().flatten(),
        end: db::get_metadata_value(&state.db, LAST_SYNC_END).await.ok().flatten(),
        at: db::get_metadata_value(&state.db, LAST_SYNC_AT).await.ok().flatten(),
    };

    sync.at.is_some().then_some(sync)
}
