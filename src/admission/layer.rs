/*!
 * # Admission Middleware
 *
 * Tower layer wiring the admission pipeline into the HTTP stack. Resolves
 * the caller context (session extension first, client address otherwise),
 * asks the pipeline for a decision, and surfaces the standard rate-limit
 * headers on every response. Denials become 429s with a machine-readable
 * reason code so clients can tell "back off briefly" from "quota spent".
 *
 * Session verification itself happens upstream; this layer trusts the
 * `CallerSession` extension it finds.
 */

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request};
use axum::http::{HeaderValue, Response};
use axum::response::IntoResponse;
use metrics::counter;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::metrics::increment_counter;

use super::pipeline::{AdmissionDecision, AdmissionPipeline, CallerIdentity, DecisionCause, RequestContext};
use super::policy::SubscriptionTier;

/// Caller context resolved by the upstream auth middleware and inserted as a
/// request extension. Absent for unauthenticated traffic.
#[derive(Debug, Clone)]
pub struct CallerSession {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
}

/// Converts a number to a header value. Numeric strings are always valid
/// ASCII header content, so the fallback is unreachable in practice.
fn num_to_header_value<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Client address, preferring proxy headers over connection info.
fn client_ip(request: &Request) -> Option<IpAddr> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Some(ip) = forwarded
            .to_str()
            .ok()
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse().ok())
        {
            return Some(ip);
        }
    }

    if let Some(ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.trim().parse().ok())
    {
        return Some(ip);
    }

    request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Builds the per-request context the gates evaluate. Authenticated callers
/// are keyed by user id; everyone else by network address.
fn request_context(request: &Request) -> RequestContext {
    let ip = client_ip(request);
    let (identity, tier) = match request.extensions().get::<CallerSession>() {
        Some(session) => (CallerIdentity::User(session.user_id), session.tier),
        None => (
            CallerIdentity::Address(ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))),
            SubscriptionTier::Anonymous,
        ),
    };

    // Prefer the route template so parameterized routes classify exactly.
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    RequestContext {
        identity,
        tier,
        method: request.method().clone(),
        path,
        client_ip: ip,
    }
}

fn apply_headers(response: &mut Response<axum::body::Body>, decision: &AdmissionDecision) {
    let headers = response.headers_mut();
    let reset_epoch = decision.reset_at.map(|t| t.timestamp());

    let _ = headers.insert("X-RateLimit-Limit", num_to_header_value(decision.limit));
    let _ = headers.insert(
        "X-RateLimit-Remaining",
        num_to_header_value(decision.remaining),
    );
    if let Some(epoch) = reset_epoch {
        let _ = headers.insert("X-RateLimit-Reset", num_to_header_value(epoch));
    }
    // RFC draft headers alongside the de-facto X- trio
    let _ = headers.insert("RateLimit-Limit", num_to_header_value(decision.limit));
    let _ = headers.insert(
        "RateLimit-Remaining",
        num_to_header_value(decision.remaining),
    );
    if let Some(epoch) = reset_epoch {
        let _ = headers.insert("RateLimit-Reset", num_to_header_value(epoch));
    }
}

fn exempt(path: &str) -> bool {
    path.starts_with("/health") || path == "/metrics" || path.starts_with("/metrics/")
}

#[derive(Clone)]
pub struct AdmissionLayer {
    pipeline: Arc<AdmissionPipeline>,
    enable_headers: bool,
}

impl AdmissionLayer {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        Self {
            pipeline,
            enable_headers: true,
        }
    }

    pub fn with_headers(mut self, enable_headers: bool) -> Self {
        self.enable_headers = enable_headers;
        self
    }
}

impl<S> tower::Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            pipeline: self.pipeline.clone(),
            enable_headers: self.enable_headers,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: Arc<AdmissionPipeline>,
    enable_headers: bool,
}

impl<S> tower::Service<Request> for AdmissionService<S>
where
    S: tower::Service<Request, Response = Response<axum::body::Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<axum::body::Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let mut inner = self.inner.clone();
        let enable_headers = self.enable_headers;

        Box::pin(async move {
            if exempt(request.uri().path()) {
                return inner.call(request).await;
            }

            let ctx = request_context(&request);
            let key_type = ctx.identity.kind();
            let decision = pipeline.admit(&ctx).await;

            if !decision.allowed {
                warn!(
                    identity = %ctx.identity.key_fragment(),
                    tier = %ctx.tier,
                    path = %ctx.path,
                    reason = ?decision.reason,
                    "request denied by admission control"
                );
                counter!(
                    "admission_denied_total",
                    1,
                    "key_type" => key_type.to_string(),
                    "path" => ctx.path.clone(),
                );
                increment_counter("admission_denied_total");

                let mut response = ApiError::RateLimited(decision.clone()).into_response();
                if enable_headers {
                    apply_headers(&mut response, &decision);
                }
                return Ok(response);
            }

            if decision.reason == Some(DecisionCause::StoreUnavailable) {
                counter!("admission_degraded_total", 1, "key_type" => key_type.to_string());
                increment_counter("admission_degraded_total");
            }

            let mut response = inner.call(request).await?;
            counter!(
                "admission_allowed_total",
                1,
                "key_type" => key_type.to_string(),
                "path" => ctx.path.clone(),
            );
            increment_counter("admission_allowed_total");

            if enable_headers {
                apply_headers(&mut response, &decision);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn exempt_paths_cover_health_and_metrics() {
        assert!(exempt("/health"));
        assert!(exempt("/health/ready"));
        assert!(exempt("/metrics"));
        assert!(exempt("/metrics/json"));
        assert!(!exempt("/api/v1/pets"));
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let request = Request::builder()
            .uri("/api/v1/pets")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn anonymous_context_keys_by_address() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/lost-pets")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        let ctx = request_context(&request);
        assert_eq!(ctx.tier, SubscriptionTier::Anonymous);
        assert_eq!(ctx.identity.key_fragment(), "ip:198.51.100.2");
        assert_eq!(ctx.path, "/api/v1/lost-pets");
    }

    #[test]
    fn session_extension_wins_over_address() {
        let user_id = Uuid::new_v4();
        let mut request = Request::builder()
            .uri("/api/v1/pets")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(CallerSession {
            user_id,
            tier: SubscriptionTier::Premium,
        });

        let ctx = request_context(&request);
        assert_eq!(ctx.tier, SubscriptionTier::Premium);
        assert_eq!(ctx.identity, CallerIdentity::User(user_id));
        // The address still rides along for geography.
        assert_eq!(ctx.client_ip, Some("198.51.100.2".parse().unwrap()));
    }
}
