use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use petfolio_api::admission::{
    AdmissionLayer, AdmissionPipeline, CallerSession, CounterStore, GeoAdjuster, NullGeoResolver,
    PolicyTable, SubscriptionTier,
};
use petfolio_api::config::AppConfig;
use petfolio_api::AppState;

/// Stands in for the upstream auth middleware: turns `x-test-user` and
/// `x-test-tier` headers into the `CallerSession` extension the admission
/// layer trusts.
async fn session_from_headers(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get("x-test-user")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok());
    let tier = request
        .headers()
        .get("x-test-tier")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| match s {
            "free" => Some(SubscriptionTier::Free),
            "premium" => Some(SubscriptionTier::Premium),
            "family" => Some(SubscriptionTier::Family),
            "anonymous" => Some(SubscriptionTier::Anonymous),
            _ => None,
        });

    if let (Some(user_id), Some(tier)) = (user_id, tier) {
        request
            .extensions_mut()
            .insert(CallerSession { user_id, tier });
    }
    next.run(request).await
}

async fn list_pets() -> impl IntoResponse {
    Json(json!({ "pets": [] }))
}

async fn report_lost_pet() -> impl IntoResponse {
    (StatusCode::CREATED, Json(json!({ "report": "created" })))
}

/// Test application wrapping a stub API surface with the admission layer.
pub struct TestApp {
    router: Router,
}

impl TestApp {
    /// Build an app around an explicit policy table and counter store so
    /// tests control limits and can spy on store traffic.
    pub fn new(table: PolicyTable, store: Arc<dyn CounterStore>) -> Self {
        Self::with_multiplier(table, store, 1.0)
    }

    pub fn with_multiplier(
        table: PolicyTable,
        store: Arc<dyn CounterStore>,
        default_multiplier: f64,
    ) -> Self {
        let table = Arc::new(table);
        let geo = Arc::new(GeoAdjuster::new(
            Arc::new(NullGeoResolver),
            Vec::<String>::new(),
            default_multiplier,
        ));
        let pipeline = Arc::new(AdmissionPipeline::new(
            store.clone(),
            table,
            geo,
            Duration::from_secs(60),
        ));

        let state = AppState {
            config: AppConfig::new(
                "redis://127.0.0.1:6379".into(),
                "127.0.0.1".into(),
                18_080,
                "test".into(),
            ),
            store,
            pipeline: pipeline.clone(),
        };

        let router = Router::new()
            .route("/api/v1/pets", get(list_pets))
            .route("/api/v1/pets/search", get(list_pets))
            .route("/api/v1/lost-pets", post(report_lost_pet))
            .merge(petfolio_api::health::health_routes())
            .layer(AdmissionLayer::new(pipeline))
            .layer(middleware::from_fn(session_from_headers))
            .with_state(state);

        Self { router }
    }

    /// Send a request with optional extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::empty()).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

/// Header value as u64, panicking with the header name when absent.
pub fn header_u64(response: &axum::response::Response, name: &str) -> u64 {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
        .parse()
        .unwrap_or_else(|_| panic!("non-numeric header {name}"))
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body was not json")
}
