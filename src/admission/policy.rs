/*!
 * # Rate Limit Policy Table
 *
 * Static configuration mapping (subscription tier x endpoint category) to a
 * quota rule, plus the classification table from concrete routes to
 * categories and the per-tier burst ceilings. Built once at startup, shared
 * by `Arc`, and read-only afterwards so tests can substitute fixture tables
 * without touching global state.
 *
 * Lookups never fail: an unknown tier resolves through `anonymous`, an
 * unclassified route resolves to `api_calls`.
 */

use std::collections::HashMap;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};

/// Subscription level controlling quota size. Resolved by the session layer
/// before admission runs; this subsystem never infers or mutates it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Premium,
    Family,
    Anonymous,
}

/// Classification bucket used to select a quota rule for an endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndpointCategory {
    ApiCalls,
    Uploads,
    LostPetReports,
    Notifications,
    Search,
    LostPetSearch,
    Registration,
}

/// A quota rule: how many requests fit into one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Applied when the rule map has no entry for a pair at all, which only
/// happens with hand-built fixture tables. Matches the anonymous api_calls
/// default.
const LAST_RESORT_RULE: RateLimitRule = RateLimitRule::new(100, Duration::from_secs(3600));
const LAST_RESORT_BURST_CEILING: u32 = 15;

/// Immutable policy configuration for the admission pipeline.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: HashMap<(SubscriptionTier, EndpointCategory), RateLimitRule>,
    routes: HashMap<(Method, String), EndpointCategory>,
    burst_ceilings: HashMap<SubscriptionTier, u32>,
}

impl PolicyTable {
    /// An empty table. Every lookup still succeeds via the fallback chain;
    /// intended for tests that add entries with the `with_*` builders.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            routes: HashMap::new(),
            burst_ceilings: HashMap::new(),
        }
    }

    pub fn with_rule(
        mut self,
        tier: SubscriptionTier,
        category: EndpointCategory,
        rule: RateLimitRule,
    ) -> Self {
        self.rules.insert((tier, category), rule);
        self
    }

    pub fn with_route(
        mut self,
        method: Method,
        path: impl Into<String>,
        category: EndpointCategory,
    ) -> Self {
        self.routes.insert((method, path.into()), category);
        self
    }

    pub fn with_burst_ceiling(mut self, tier: SubscriptionTier, ceiling: u32) -> Self {
        self.burst_ceilings.insert(tier, ceiling.max(1));
        self
    }

    /// Exact (method, route template) lookup; anything unlisted is a plain
    /// API call. Pure and total.
    pub fn classify(&self, method: &Method, path: &str) -> EndpointCategory {
        self.routes
            .get(&(method.clone(), path.to_string()))
            .copied()
            .unwrap_or(EndpointCategory::ApiCalls)
    }

    /// Quota rule for a (tier, category) pair. Tiers without an entry fall
    /// back to the anonymous tier's rules, categories without an entry fall
    /// back to api_calls. Always returns a usable rule.
    pub fn rule_for(&self, tier: SubscriptionTier, category: EndpointCategory) -> RateLimitRule {
        self.rules
            .get(&(tier, category))
            .or_else(|| self.rules.get(&(SubscriptionTier::Anonymous, category)))
            .or_else(|| self.rules.get(&(tier, EndpointCategory::ApiCalls)))
            .or_else(|| {
                self.rules
                    .get(&(SubscriptionTier::Anonymous, EndpointCategory::ApiCalls))
            })
            .copied()
            .unwrap_or(LAST_RESORT_RULE)
    }

    /// Short-window request ceiling for a tier, independent of endpoint.
    pub fn burst_ceiling(&self, tier: SubscriptionTier) -> u32 {
        self.burst_ceilings
            .get(&tier)
            .or_else(|| self.burst_ceilings.get(&SubscriptionTier::Anonymous))
            .copied()
            .unwrap_or(LAST_RESORT_BURST_CEILING)
    }
}

impl Default for PolicyTable {
    /// The production defaults. Quota numbers are deployment configuration,
    /// not design; these match the hosted Petfolio plans.
    fn default() -> Self {
        use EndpointCategory::*;
        use SubscriptionTier::*;

        const HOUR: Duration = Duration::from_secs(3600);
        const DAY: Duration = Duration::from_secs(86_400);
        const MINUTE: Duration = Duration::from_secs(60);

        let mut table = Self::empty()
            .with_burst_ceiling(Anonymous, 15)
            .with_burst_ceiling(Free, 30)
            .with_burst_ceiling(Premium, 60)
            .with_burst_ceiling(Family, 90);

        let rules: &[(SubscriptionTier, EndpointCategory, u32, Duration)] = &[
            (Anonymous, ApiCalls, 100, HOUR),
            (Free, ApiCalls, 300, HOUR),
            (Premium, ApiCalls, 1000, HOUR),
            (Family, ApiCalls, 1500, HOUR),
            (Anonymous, Uploads, 5, HOUR),
            (Free, Uploads, 20, HOUR),
            (Premium, Uploads, 100, HOUR),
            (Family, Uploads, 150, HOUR),
            (Anonymous, LostPetReports, 2, DAY),
            (Free, LostPetReports, 5, DAY),
            (Premium, LostPetReports, 20, DAY),
            (Family, LostPetReports, 30, DAY),
            (Anonymous, Notifications, 10, HOUR),
            (Free, Notifications, 50, HOUR),
            (Premium, Notifications, 200, HOUR),
            (Family, Notifications, 300, HOUR),
            (Anonymous, Search, 10, MINUTE),
            (Free, Search, 30, MINUTE),
            (Premium, Search, 60, MINUTE),
            (Family, Search, 90, MINUTE),
            // Lost-pet search is deliberately more generous than general
            // search: reuniting a lost pet is time-critical.
            (Anonymous, LostPetSearch, 15, MINUTE),
            (Free, LostPetSearch, 45, MINUTE),
            (Premium, LostPetSearch, 90, MINUTE),
            (Family, LostPetSearch, 120, MINUTE),
            (Anonymous, Registration, 3, DAY),
            (Free, Registration, 3, DAY),
            (Premium, Registration, 5, DAY),
            (Family, Registration, 10, DAY),
        ];
        for &(tier, category, limit, window) in rules {
            table = table.with_rule(tier, category, RateLimitRule::new(limit, window));
        }

        table
            .with_route(Method::POST, "/api/v1/pets/:id/photos", Uploads)
            .with_route(Method::POST, "/api/v1/pets/:id/documents", Uploads)
            .with_route(Method::POST, "/api/v1/lost-pets", LostPetReports)
            .with_route(Method::GET, "/api/v1/lost-pets/search", LostPetSearch)
            .with_route(Method::GET, "/api/v1/pets/search", Search)
            .with_route(Method::GET, "/api/v1/search", Search)
            .with_route(Method::POST, "/api/v1/notifications", Notifications)
            .with_route(Method::POST, "/api/v1/notifications/devices", Notifications)
            .with_route(Method::POST, "/api/v1/auth/register", Registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn classification_is_total() {
        let table = PolicyTable::default();
        assert_eq!(
            table.classify(&Method::POST, "/api/v1/lost-pets"),
            EndpointCategory::LostPetReports
        );
        assert_eq!(
            table.classify(&Method::GET, "/api/v1/lost-pets/search"),
            EndpointCategory::LostPetSearch
        );
        // Same path, different method: not an exact match.
        assert_eq!(
            table.classify(&Method::GET, "/api/v1/lost-pets"),
            EndpointCategory::ApiCalls
        );
        assert_eq!(
            table.classify(&Method::DELETE, "/never/registered"),
            EndpointCategory::ApiCalls
        );
    }

    #[test]
    fn rule_lookup_is_total_and_usable() {
        let table = PolicyTable::default();
        for tier in SubscriptionTier::iter() {
            for category in EndpointCategory::iter() {
                let rule = table.rule_for(tier, category);
                assert!(rule.limit >= 1, "{tier}/{category} has zero limit");
                assert!(rule.window > Duration::ZERO, "{tier}/{category} has zero window");
            }
        }
    }

    #[test]
    fn missing_tier_falls_back_to_anonymous() {
        let table = PolicyTable::empty().with_rule(
            SubscriptionTier::Anonymous,
            EndpointCategory::Uploads,
            RateLimitRule::new(7, Duration::from_secs(60)),
        );
        let rule = table.rule_for(SubscriptionTier::Premium, EndpointCategory::Uploads);
        assert_eq!(rule.limit, 7);
    }

    #[test]
    fn missing_category_falls_back_to_api_calls() {
        let table = PolicyTable::empty().with_rule(
            SubscriptionTier::Free,
            EndpointCategory::ApiCalls,
            RateLimitRule::new(42, Duration::from_secs(60)),
        );
        let rule = table.rule_for(SubscriptionTier::Free, EndpointCategory::Search);
        assert_eq!(rule.limit, 42);
    }

    #[test]
    fn empty_table_still_answers() {
        let table = PolicyTable::empty();
        let rule = table.rule_for(SubscriptionTier::Family, EndpointCategory::Registration);
        assert!(rule.limit >= 1);
        assert!(table.burst_ceiling(SubscriptionTier::Family) >= 1);
    }

    #[test]
    fn burst_ceilings_order_anonymous_most_restrictive() {
        let table = PolicyTable::default();
        let anonymous = table.burst_ceiling(SubscriptionTier::Anonymous);
        let free = table.burst_ceiling(SubscriptionTier::Free);
        let premium = table.burst_ceiling(SubscriptionTier::Premium);
        let family = table.burst_ceiling(SubscriptionTier::Family);
        assert!(anonymous < free && free < premium && premium < family);
    }

    #[test]
    fn tier_and_category_render_as_snake_case() {
        assert_eq!(SubscriptionTier::Premium.to_string(), "premium");
        assert_eq!(
            EndpointCategory::LostPetReports.to_string(),
            "lost_pet_reports"
        );
    }
}
