/*!
 * # Burst Guard
 *
 * Short fixed-window gate per caller identity, independent of endpoint.
 * Exists to reject request floods cheaply, before the quota gate pays a
 * second store round-trip and before a flood can drain a caller's
 * longer-window budget.
 */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::pipeline::{AdmissionDecision, DecisionCause, Gate, RequestContext};
use super::policy::PolicyTable;
use super::store::CounterStore;

pub struct BurstGuard {
    store: Arc<dyn CounterStore>,
    table: Arc<PolicyTable>,
    window: Duration,
}

impl BurstGuard {
    pub fn new(store: Arc<dyn CounterStore>, table: Arc<PolicyTable>, window: Duration) -> Self {
        Self {
            store,
            table,
            window,
        }
    }

    fn key(ctx: &RequestContext) -> String {
        format!("burst:{}", ctx.identity.key_fragment())
    }
}

#[async_trait]
impl Gate for BurstGuard {
    fn name(&self) -> &'static str {
        "burst"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> AdmissionDecision {
        let ceiling = self.table.burst_ceiling(ctx.tier);
        let key = Self::key(ctx);

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, %key, "burst counter unavailable, failing open");
                return AdmissionDecision::degraded(ceiling);
            }
        };

        if count == 1 {
            // The increment that created the key arms the window, exactly
            // once. Later increments never move the deadline.
            if let Err(err) = self.store.expire(&key, self.window).await {
                warn!(%err, %key, "failed to arm burst window");
            }
        }

        let allowed = count <= u64::from(ceiling);
        let remaining = u64::from(ceiling).saturating_sub(count) as u32;
        let reset_at = if allowed {
            None
        } else {
            // Only denials pay for the TTL read; allows get their reset from
            // the quota gate.
            match self.store.time_to_live(&key).await {
                Ok(ttl) => ttl
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .map(|d| Utc::now() + d),
                Err(err) => {
                    warn!(%err, %key, "failed to read burst window ttl");
                    None
                }
            }
        };

        AdmissionDecision {
            allowed,
            limit: ceiling,
            remaining,
            reset_at,
            reason: (!allowed).then_some(DecisionCause::BurstExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::pipeline::CallerIdentity;
    use crate::admission::policy::SubscriptionTier;
    use crate::admission::store::{InMemoryCounterStore, StoreError};
    use http::Method;

    fn ctx(tier: SubscriptionTier) -> RequestContext {
        RequestContext {
            identity: CallerIdentity::Address("203.0.113.4".parse().unwrap()),
            tier,
            method: Method::GET,
            path: "/api/v1/pets".into(),
            client_ip: None,
        }
    }

    fn guard_with(store: Arc<dyn CounterStore>, ceiling: u32) -> BurstGuard {
        let table = PolicyTable::empty().with_burst_ceiling(SubscriptionTier::Free, ceiling);
        BurstGuard::new(store, Arc::new(table), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn denies_past_the_ceiling() {
        let guard = guard_with(Arc::new(InMemoryCounterStore::new()), 2);
        let ctx = ctx(SubscriptionTier::Free);

        let first = guard.evaluate(&ctx).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = guard.evaluate(&ctx).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = guard.evaluate(&ctx).await;
        assert!(!third.allowed);
        assert_eq!(third.reason, Some(DecisionCause::BurstExceeded));
        assert_eq!(third.remaining, 0);
        assert!(third.reset_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn window_rearms_after_expiry() {
        let guard = guard_with(Arc::new(InMemoryCounterStore::new()), 1);
        let ctx = ctx(SubscriptionTier::Free);

        assert!(guard.evaluate(&ctx).await.allowed);
        assert!(!guard.evaluate(&ctx).await.allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(guard.evaluate(&ctx).await.allowed);
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn time_to_live(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let guard = guard_with(Arc::new(DownStore), 2);
        let decision = guard.evaluate(&ctx(SubscriptionTier::Free)).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, Some(DecisionCause::StoreUnavailable));
    }
}
