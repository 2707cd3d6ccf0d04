/*!
 * # Health Check Module
 *
 * Endpoints for monitoring the admission service:
 *
 * - Basic health check (`/health`) - Simple up/down status
 * - Liveness check (`/health/live`) - Checks if the process is alive
 * - Readiness check (`/health/ready`) - Probes the counter store
 *
 * A down counter store reports `degraded`, not `down`: the admission layer
 * fails open, so the service keeps accepting traffic without enforcement.
 */

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::warn;

use crate::admission::CounterStore;
use crate::AppState;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthDetail {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, HealthDetail>,
}

pub async fn simple_health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "up" })))
}

pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "up" })))
}

/// Readiness probes the counter store with a TTL read on a probe key. Store
/// failures degrade rather than fail: admission control fails open by
/// design, so the API stays ready without it.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_detail = match state.store.time_to_live("health:probe").await {
        Ok(_) => HealthDetail {
            status: HealthStatus::Up,
            message: None,
            timestamp: Utc::now(),
        },
        Err(err) => {
            warn!(%err, "counter store readiness probe failed");
            HealthDetail {
                status: HealthStatus::Degraded,
                message: Some(format!("counter store unreachable: {err}")),
                timestamp: Utc::now(),
            }
        }
    };

    let overall = store_detail.status.clone();
    let mut details = HashMap::new();
    details.insert("counter_store".to_string(), store_detail);

    let info = HealthInfo {
        status: overall,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        details,
    };

    (StatusCode::OK, Json(info))
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(simple_health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
}
