/*!
 * # Geographic Adjuster
 *
 * Scales a base quota rule by caller geography before it is enforced.
 * Country resolution is an injected collaborator; this module only consumes
 * its result. Primary-market countries keep the full limit, everything else
 * (including lookup failures and absent client addresses) shares a single
 * reduced multiplier.
 *
 * The multiplier only changes the computed limit, never the counter key, so
 * a caller's usage history stays comparable across IP changes.
 */

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use super::policy::RateLimitRule;

/// External geo-IP lookup. Implementations must be fast enough to call on
/// the request path or resolve ahead of time.
pub trait GeoResolver: Send + Sync {
    /// ISO 3166-1 alpha-2 country code for `ip`, or `None` when unknown.
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver for deployments without a geo database: every lookup misses, so
/// every caller gets the default multiplier.
#[derive(Debug, Default, Clone)]
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Fixed-table resolver, used by tests and static deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticGeoResolver {
    entries: std::collections::HashMap<IpAddr, String>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, ip: IpAddr, country: impl Into<String>) -> Self {
        self.entries.insert(ip, country.into().to_ascii_uppercase());
        self
    }
}

impl GeoResolver for StaticGeoResolver {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.entries.get(&ip).cloned()
    }
}

/// Applies the geography multiplier to base quota rules.
#[derive(Clone)]
pub struct GeoAdjuster {
    resolver: Arc<dyn GeoResolver>,
    primary_markets: HashSet<String>,
    default_multiplier: f64,
}

impl GeoAdjuster {
    /// `default_multiplier` must sit in (0, 1]; configuration validates the
    /// range before this is constructed.
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        primary_markets: impl IntoIterator<Item = String>,
        default_multiplier: f64,
    ) -> Self {
        Self {
            resolver,
            primary_markets: primary_markets
                .into_iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect(),
            default_multiplier: default_multiplier.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Multiplier for a caller address: 1.0 for primary markets, the default
    /// multiplier for everything else including unknowns.
    pub fn multiplier_for(&self, ip: Option<IpAddr>) -> f64 {
        let country = ip.and_then(|ip| self.resolver.lookup(ip));
        match country {
            Some(code) if self.primary_markets.contains(&code.to_ascii_uppercase()) => 1.0,
            _ => self.default_multiplier,
        }
    }

    /// Returns `rule` with the limit scaled by the caller's multiplier and
    /// floored, clamped to at least 1 so no geography is blocked outright.
    /// The window never changes. Applied fresh on every check, so a caller
    /// changing countries mid-window sees the new ceiling immediately.
    pub fn adjust(&self, rule: RateLimitRule, ip: Option<IpAddr>) -> RateLimitRule {
        let multiplier = self.multiplier_for(ip);
        let scaled = (f64::from(rule.limit) * multiplier).floor() as u32;
        RateLimitRule {
            limit: scaled.max(1),
            window: rule.window,
        }
    }
}
