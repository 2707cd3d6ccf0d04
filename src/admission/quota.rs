/*!
 * # Quota Gate
 *
 * The longer-window gate: classifies the endpoint, looks up the tier's rule,
 * scales it by geography, and counts the request against the (identity,
 * category) counter. Geography only moves the computed limit; the counter
 * key deliberately excludes it so usage history survives minor IP changes
 * such as mobile network handoffs.
 */

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::geo::GeoAdjuster;
use super::pipeline::{AdmissionDecision, DecisionCause, Gate, RequestContext};
use super::policy::PolicyTable;
use super::store::CounterStore;

pub struct QuotaGate {
    store: Arc<dyn CounterStore>,
    table: Arc<PolicyTable>,
    geo: Arc<GeoAdjuster>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn CounterStore>, table: Arc<PolicyTable>, geo: Arc<GeoAdjuster>) -> Self {
        Self { store, table, geo }
    }
}

#[async_trait]
impl Gate for QuotaGate {
    fn name(&self) -> &'static str {
        "quota"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> AdmissionDecision {
        let category = self.table.classify(&ctx.method, &ctx.path);
        let base = self.table.rule_for(ctx.tier, category);
        let rule = self.geo.adjust(base, ctx.client_ip);
        let key = format!("quota:{}:{}", ctx.identity.key_fragment(), category);

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, %key, %category, "quota counter unavailable, failing open");
                return AdmissionDecision::degraded(rule.limit);
            }
        };

        if count == 1 {
            if let Err(err) = self.store.expire(&key, rule.window).await {
                warn!(%err, %key, "failed to arm quota window");
            }
        }

        let ttl = match self.store.time_to_live(&key).await {
            Ok(Some(ttl)) => Some(ttl),
            Ok(None) if count > 1 => {
                // A counter without expiry means an earlier EXPIRE was lost.
                // Arming it now starts a fresh window; it never extends a
                // live one.
                warn!(%key, "quota counter had no expiry, re-arming window");
                if let Err(err) = self.store.expire(&key, rule.window).await {
                    warn!(%err, %key, "failed to re-arm quota window");
                }
                Some(rule.window)
            }
            Ok(None) => Some(rule.window),
            Err(err) => {
                warn!(%err, %key, "failed to read quota window ttl");
                None
            }
        };

        let allowed = count <= u64::from(rule.limit);
        let remaining = u64::from(rule.limit).saturating_sub(count) as u32;
        let reset_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|d| Utc::now() + d);

        AdmissionDecision {
            allowed,
            limit: rule.limit,
            remaining,
            reset_at,
            reason: (!allowed).then_some(DecisionCause::RateExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::geo::{NullGeoResolver, StaticGeoResolver};
    use crate::admission::pipeline::CallerIdentity;
    use crate::admission::policy::{EndpointCategory, RateLimitRule, SubscriptionTier};
    use crate::admission::store::InMemoryCounterStore;
    use http::Method;
    use std::net::IpAddr;
    use std::time::Duration;
    use uuid::Uuid;

    fn table() -> PolicyTable {
        PolicyTable::empty()
            .with_rule(
                SubscriptionTier::Free,
                EndpointCategory::LostPetReports,
                RateLimitRule::new(5, Duration::from_secs(86_400)),
            )
            .with_rule(
                SubscriptionTier::Free,
                EndpointCategory::ApiCalls,
                RateLimitRule::new(100, Duration::from_secs(3600)),
            )
            .with_route(
                Method::POST,
                "/api/v1/lost-pets",
                EndpointCategory::LostPetReports,
            )
    }

    fn report_ctx() -> RequestContext {
        RequestContext {
            identity: CallerIdentity::User(Uuid::nil()),
            tier: SubscriptionTier::Free,
            method: Method::POST,
            path: "/api/v1/lost-pets".into(),
            client_ip: None,
        }
    }

    fn gate(store: Arc<dyn CounterStore>, multiplier: f64) -> QuotaGate {
        QuotaGate::new(
            store,
            Arc::new(table()),
            Arc::new(GeoAdjuster::new(
                Arc::new(NullGeoResolver),
                Vec::new(),
                multiplier,
            )),
        )
    }

    #[tokio::test]
    async fn counts_down_and_denies_past_the_limit() {
        let gate = gate(Arc::new(InMemoryCounterStore::new()), 1.0);
        let ctx = report_ctx();

        for expected_remaining in [4u32, 3, 2, 1, 0] {
            let decision = gate.evaluate(&ctx).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
            assert!(decision.reset_at.is_some());
        }

        let sixth = gate.evaluate(&ctx).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.reason, Some(DecisionCause::RateExceeded));
    }

    #[tokio::test]
    async fn categories_count_independently() {
        let store = Arc::new(InMemoryCounterStore::new());
        let gate = gate(store, 1.0);

        let report = report_ctx();
        let browse = RequestContext {
            method: Method::GET,
            path: "/api/v1/pets".into(),
            ..report_ctx()
        };

        for _ in 0..5 {
            assert!(gate.evaluate(&report).await.allowed);
        }
        assert!(!gate.evaluate(&report).await.allowed);
        // The api_calls counter is untouched by the exhausted report quota.
        let decision = gate.evaluate(&browse).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn geography_scales_the_limit_but_not_the_key() {
        let store = Arc::new(InMemoryCounterStore::new());
        let resolver = StaticGeoResolver::new()
            .with_entry("203.0.113.1".parse::<IpAddr>().unwrap(), "US");
        let gate = QuotaGate::new(
            store,
            Arc::new(table()),
            Arc::new(GeoAdjuster::new(
                Arc::new(resolver),
                ["US".to_string()],
                0.4,
            )),
        );

        let abroad = RequestContext {
            client_ip: Some("198.51.100.20".parse().unwrap()),
            ..report_ctx()
        };
        // floor(5 * 0.4) = 2
        assert_eq!(gate.evaluate(&abroad).await.limit, 2);
        assert!(gate.evaluate(&abroad).await.allowed);
        assert!(!gate.evaluate(&abroad).await.allowed);

        // Same identity from a primary market: the shared counter already
        // holds 3, but the full limit applies immediately.
        let home = RequestContext {
            client_ip: Some("203.0.113.1".parse().unwrap()),
            ..report_ctx()
        };
        let decision = gate.evaluate(&home).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_restores_the_full_quota() {
        let gate = gate(Arc::new(InMemoryCounterStore::new()), 1.0);
        let ctx = report_ctx();

        for _ in 0..5 {
            assert!(gate.evaluate(&ctx).await.allowed);
        }
        assert!(!gate.evaluate(&ctx).await.allowed);

        tokio::time::advance(Duration::from_secs(86_401)).await;
        let decision = gate.evaluate(&ctx).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }
}
