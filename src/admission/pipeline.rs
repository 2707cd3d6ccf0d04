/*!
 * # Admission Pipeline
 *
 * Orchestrates admission gates in a fixed order: the burst guard first, the
 * tier/category/geography quota gate second. Gates share a common `Gate`
 * capability and are invoked in sequence, short-circuiting on the first
 * denial; a caller flooding an endpoint never consumes longer-window quota.
 *
 * The pipeline holds no mutable state of its own. All counting happens in
 * the external store; any store failure degrades to an allow tagged
 * `store_unavailable` rather than an error.
 */

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Method;
use serde::Serialize;
use uuid::Uuid;

/// Who is asking. Exactly one variant per request; the sole basis for
/// counter keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// Authenticated caller, keyed by stable user id.
    User(Uuid),
    /// Unauthenticated caller, keyed by network address.
    Address(IpAddr),
}

impl CallerIdentity {
    /// Stable key fragment used for both burst and quota counters.
    pub fn key_fragment(&self) -> String {
        match self {
            CallerIdentity::User(id) => format!("user:{id}"),
            CallerIdentity::Address(ip) => format!("ip:{ip}"),
        }
    }

    /// Label for metrics, never part of a counter key.
    pub fn kind(&self) -> &'static str {
        match self {
            CallerIdentity::User(_) => "user",
            CallerIdentity::Address(_) => "ip",
        }
    }
}

/// Everything a gate needs to evaluate one request. Immutable per request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: CallerIdentity,
    pub tier: super::policy::SubscriptionTier,
    pub method: Method,
    /// Route template when known (e.g. `/api/v1/pets/:id/photos`), raw URI
    /// path otherwise.
    pub path: String,
    /// Client address used only for geography; quota keys never include it.
    pub client_ip: Option<IpAddr>,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionCause {
    /// Short-window ceiling hit; the caller should back off briefly.
    BurstExceeded,
    /// The tier's longer-window quota for this category is spent.
    RateExceeded,
    /// The counter store was unreachable and the request was admitted
    /// without enforcement.
    StoreUnavailable,
}

/// The outcome of one admission check. Produced fresh per request, never
/// persisted. Carries everything the transport layer needs for rate-limit
/// headers and a 429 body.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionCause>,
}

impl AdmissionDecision {
    /// Fail-open decision: the request passes, consumption is unknowable.
    pub fn degraded(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: None,
            reason: Some(DecisionCause::StoreUnavailable),
        }
    }

    /// Whole seconds until the window resets, for `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let reset_at = self.reset_at?;
        let delta = reset_at.signed_duration_since(Utc::now()).num_seconds();
        Some(delta.max(0) as u64)
    }
}

/// One admission policy. Gates are evaluated in pipeline order and must not
/// touch their counters when an earlier gate already denied.
#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluates the request. Must not error: store failures degrade to an
    /// allow tagged `store_unavailable`.
    async fn evaluate(&self, ctx: &RequestContext) -> AdmissionDecision;
}

/// Ordered gate composition. The final decision is the first denial, or the
/// last gate's allow.
pub struct AdmissionPipeline {
    gates: Vec<Arc<dyn Gate>>,
}

impl AdmissionPipeline {
    /// The standard two-gate pipeline: burst guard, then quota.
    pub fn new(
        store: Arc<dyn super::store::CounterStore>,
        table: Arc<super::policy::PolicyTable>,
        geo: Arc<super::geo::GeoAdjuster>,
        burst_window: std::time::Duration,
    ) -> Self {
        Self {
            gates: vec![
                Arc::new(super::burst::BurstGuard::new(
                    store.clone(),
                    table.clone(),
                    burst_window,
                )),
                Arc::new(super::quota::QuotaGate::new(store, table, geo)),
            ],
        }
    }

    /// Custom gate order, for tests and bespoke deployments.
    pub fn with_gates(gates: Vec<Arc<dyn Gate>>) -> Self {
        Self { gates }
    }

    /// The single entry point: runs every gate in order, short-circuiting on
    /// the first denial. A degraded verdict from an earlier gate is threaded
    /// through to the final decision so monitoring can tell "under limit"
    /// from "limiter degraded".
    pub async fn admit(&self, ctx: &RequestContext) -> AdmissionDecision {
        let mut degraded = false;
        let mut decision = AdmissionDecision {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: None,
            reason: None,
        };

        for gate in &self.gates {
            decision = gate.evaluate(ctx).await;
            tracing::debug!(
                gate = gate.name(),
                allowed = decision.allowed,
                remaining = decision.remaining,
                "admission gate evaluated"
            );
            if !decision.allowed {
                return decision;
            }
            if decision.reason == Some(DecisionCause::StoreUnavailable) {
                degraded = true;
            }
        }

        if degraded && decision.reason.is_none() {
            decision.reason = Some(DecisionCause::StoreUnavailable);
        }
        decision
    }
}
