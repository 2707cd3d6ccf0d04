use std::{net::SocketAddr, sync::Arc};

use axum::http::StatusCode;
use axum::{routing::get, Router};
use http::HeaderValue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use petfolio_api as api;
use petfolio_api::admission::{
    AdmissionLayer, AdmissionPipeline, CounterStore, GeoAdjuster, InMemoryCounterStore,
    NullGeoResolver, PolicyTable, RedisCounterStore, SubscriptionTier,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Counter store: Redis for multi-instance deployments, in-memory otherwise.
    // Construction only; connectivity is checked by the readiness probe.
    let store: Arc<dyn CounterStore> = if cfg.admission.use_redis {
        let redis_client = Arc::new(redis::Client::open(cfg.redis_url.clone())?);
        Arc::new(RedisCounterStore::new(
            redis_client,
            cfg.admission.namespace.clone(),
            cfg.admission.store_timeout(),
        ))
    } else {
        info!("Redis disabled for admission counters; using in-memory store");
        Arc::new(InMemoryCounterStore::new())
    };

    let table = Arc::new(
        PolicyTable::default()
            .with_burst_ceiling(SubscriptionTier::Anonymous, cfg.admission.burst_anonymous)
            .with_burst_ceiling(SubscriptionTier::Free, cfg.admission.burst_free)
            .with_burst_ceiling(SubscriptionTier::Premium, cfg.admission.burst_premium)
            .with_burst_ceiling(SubscriptionTier::Family, cfg.admission.burst_family),
    );

    // Geo lookups are an external collaborator; without one every caller
    // gets the default multiplier.
    let geo = Arc::new(GeoAdjuster::new(
        Arc::new(NullGeoResolver),
        cfg.admission.primary_market_codes(),
        cfg.admission.default_geo_multiplier,
    ));

    let pipeline = Arc::new(AdmissionPipeline::new(
        store.clone(),
        table,
        geo,
        cfg.admission.burst_window(),
    ));

    let app_state = api::AppState {
        config: cfg.clone(),
        store,
        pipeline: pipeline.clone(),
    };

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::permissive()
    };

    let admission_layer =
        AdmissionLayer::new(pipeline).with_headers(cfg.admission.enable_headers);

    // The session middleware that resolves authenticated callers into a
    // CallerSession extension sits upstream of this service; requests
    // arriving without one are admitted as anonymous.
    let app = Router::new()
        .route("/", get(|| async { "petfolio-api up" }))
        .route(
            "/metrics",
            get(|| async move {
                match api::metrics::metrics_handler().await {
                    Ok(body) => (StatusCode::OK, body),
                    Err(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        String::from("metrics error"),
                    ),
                }
            }),
        )
        .route(
            "/metrics/json",
            get(|| async move {
                match api::metrics::metrics_json_handler().await {
                    Ok(json) => (StatusCode::OK, axum::Json(json)),
                    Err(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        axum::Json(serde_json::json!({"error":"metrics error"})),
                    ),
                }
            }),
        )
        .merge(api::health::health_routes())
        .layer(admission_layer)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(app_state);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("petfolio-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
