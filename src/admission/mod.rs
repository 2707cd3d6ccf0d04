/*!
 * # Admission Control
 *
 * Tiered admission control for the Petfolio API: a composable pipeline that
 * enforces a short-window burst cap per caller, a longer-window quota scoped
 * by subscription tier and endpoint category, and a geography adjustment on
 * the quota limit.
 *
 * The only durable state lives in an external atomic-counter store (Redis in
 * production); the pipeline itself holds read-only configuration and fails
 * open when the store is unreachable, trading strict enforcement for
 * availability during infrastructure incidents.
 *
 * ## Usage
 *
 * ```ignore
 * let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
 * let table = Arc::new(PolicyTable::default());
 * let geo = Arc::new(GeoAdjuster::new(Arc::new(NullGeoResolver), markets, 0.5));
 * let pipeline = Arc::new(AdmissionPipeline::new(store, table, geo, Duration::from_secs(60)));
 *
 * let app = Router::new()
 *     .route("/api/v1/pets", get(list_pets))
 *     .layer(AdmissionLayer::new(pipeline));
 * ```
 */

pub mod burst;
pub mod geo;
pub mod layer;
pub mod pipeline;
pub mod policy;
pub mod quota;
pub mod store;

pub use burst::BurstGuard;
pub use geo::{GeoAdjuster, GeoResolver, NullGeoResolver, StaticGeoResolver};
pub use layer::{AdmissionLayer, CallerSession};
pub use pipeline::{
    AdmissionDecision, AdmissionPipeline, CallerIdentity, DecisionCause, Gate, RequestContext,
};
pub use policy::{EndpointCategory, PolicyTable, RateLimitRule, SubscriptionTier};
pub use quota::QuotaGate;
pub use store::{CounterStore, InMemoryCounterStore, RedisCounterStore, StoreError};
