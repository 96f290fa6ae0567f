//! Request interceptor that runs the limiter before a handler.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use http::{HeaderMap, Response, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::{FailurePolicy, TurnstileConfig};
use crate::error::Result;
use crate::ratelimit::{Limiter, RateLimit, RateLimitInfo};

/// Body of the default over-limit response.
pub const DEFAULT_REJECTION_BODY: &str = "Rate limit was exceeded";

/// Identity used when a request carries no remote address.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// The parts of a request the default extractors look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Address of the peer that sent the request
    pub remote_addr: Option<IpAddr>,
    /// Route or endpoint identifier
    pub endpoint: String,
}

impl RequestMeta {
    /// Create a request view.
    pub fn new(remote_addr: Option<IpAddr>, endpoint: impl Into<String>) -> Self {
        Self {
            remote_addr,
            endpoint: endpoint.into(),
        }
    }
}

/// Pulls an identity or a scope out of a request.
pub type Extractor<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;

/// Builds the response sent when a request is over its quota.
pub type OverLimitFn = Arc<dyn Fn(&RateLimitInfo) -> Rejection + Send + Sync>;

/// A response refusing a request.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Response status
    pub status: StatusCode,
    /// Response body
    pub body: String,
    /// Response headers
    pub headers: HeaderMap,
}

impl Rejection {
    /// The default answer: `429 Too Many Requests` with a text body.
    pub fn too_many_requests(_info: &RateLimitInfo) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: DEFAULT_REJECTION_BODY.to_string(),
            headers: HeaderMap::new(),
        }
    }

    /// Convert into an `http` response.
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// What the guard decided for one request.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Run the handler. Carries the decision, or `None` when the backend
    /// failed under [`FailurePolicy::Open`].
    Proceed(Option<RateLimitInfo>),
    /// Answer with the rejection instead of running the handler.
    Reject(Rejection),
}

impl Verdict {
    /// Whether the handler should run.
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed(_))
    }
}

/// Runs a [`Limiter`] in front of request handlers.
///
/// Identity and scope come from two injectable extractors; with
/// [`RequestMeta`] requests they default to the remote address and the
/// endpoint.
pub struct Guard<R = RequestMeta> {
    limiter: Arc<Limiter>,
    rule: RateLimit,
    identity_fn: Extractor<R>,
    scope_fn: Extractor<R>,
    over_limit: Option<OverLimitFn>,
    inject_headers: bool,
    failure_policy: FailurePolicy,
}

impl Guard<RequestMeta> {
    /// Guard [`RequestMeta`] requests with the default extractors.
    pub fn new(limiter: Arc<Limiter>, rule: RateLimit) -> Self {
        Self::with_extractors(
            limiter,
            rule,
            |req: &RequestMeta| {
                req.remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
            },
            |req: &RequestMeta| req.endpoint.clone(),
        )
    }
}

impl<R> Guard<R> {
    /// Guard requests of any type, using the given extractors.
    pub fn with_extractors<I, S>(
        limiter: Arc<Limiter>,
        rule: RateLimit,
        identity_fn: I,
        scope_fn: S,
    ) -> Self
    where
        I: Fn(&R) -> String + Send + Sync + 'static,
        S: Fn(&R) -> String + Send + Sync + 'static,
    {
        Self {
            limiter,
            rule,
            identity_fn: Arc::new(identity_fn),
            scope_fn: Arc::new(scope_fn),
            over_limit: Some(Arc::new(Rejection::too_many_requests)),
            inject_headers: true,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Take header injection and failure policy from `config`.
    pub fn configured(self, config: &TurnstileConfig) -> Self {
        self.inject_headers(config.inject_headers)
            .failure_policy(config.failure_policy)
    }

    /// Replace the identity extractor.
    pub fn identity_fn<F>(mut self, identity_fn: F) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        self.identity_fn = Arc::new(identity_fn);
        self
    }

    /// Replace the scope extractor.
    pub fn scope_fn<F>(mut self, scope_fn: F) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        self.scope_fn = Arc::new(scope_fn);
        self
    }

    /// Replace the over-limit response.
    pub fn on_over_limit<F>(mut self, over_limit: F) -> Self
    where
        F: Fn(&RateLimitInfo) -> Rejection + Send + Sync + 'static,
    {
        self.over_limit = Some(Arc::new(over_limit));
        self
    }

    /// Let over-limit requests through; the handler sees `exceeded` itself.
    pub fn without_rejection(mut self) -> Self {
        self.over_limit = None;
        self
    }

    /// Enable or disable `X-RateLimit-*` headers for every decision.
    pub fn inject_headers(mut self, inject_headers: bool) -> Self {
        self.inject_headers = inject_headers;
        self
    }

    /// Choose how backend failures are handled.
    pub fn failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// The rule applied to every request.
    pub fn rule(&self) -> &RateLimit {
        &self.rule
    }

    /// Write the decision's headers into `headers`, if enabled.
    pub fn apply_headers(&self, info: &RateLimitInfo, headers: &mut HeaderMap) {
        if self.inject_headers {
            info.apply_headers(headers);
        }
    }

    /// Decide whether `request` may proceed.
    ///
    /// Under [`FailurePolicy::Closed`] a backend failure is returned as an
    /// error; under [`FailurePolicy::Open`] it is logged and the request
    /// proceeds without a decision.
    #[instrument(skip_all)]
    pub async fn check(&self, request: &R) -> Result<Verdict> {
        let identity = (self.identity_fn)(request);
        let scope = (self.scope_fn)(request);

        let info = match self.limiter.decide(&identity, &scope, &self.rule).await {
            Ok(info) => info,
            Err(err) if err.is_unavailable() && self.failure_policy == FailurePolicy::Open => {
                warn!(
                    identity = %identity,
                    scope = %scope,
                    error = %err,
                    "Rate limit backend unavailable, letting request through"
                );
                return Ok(Verdict::Proceed(None));
            }
            Err(err) => return Err(err),
        };

        match &self.over_limit {
            Some(over_limit) if info.exceeded => {
                debug!(identity = %identity, scope = %scope, "Rejecting request over rate limit");
                let mut rejection = over_limit(&info);
                self.apply_headers(&info, &mut rejection.headers);
                Ok(Verdict::Reject(rejection))
            }
            _ => Ok(Verdict::Proceed(Some(info))),
        }
    }

    /// Check `request`, then either reject it or run `handler` with the
    /// decision and add the rate limit headers to its response.
    pub async fn run<F, Fut>(&self, request: &R, handler: F) -> Result<Response<String>>
    where
        F: FnOnce(Option<RateLimitInfo>) -> Fut,
        Fut: Future<Output = Response<String>>,
    {
        match self.check(request).await? {
            Verdict::Reject(rejection) => Ok(rejection.into_response()),
            Verdict::Proceed(info) => {
                let mut response = handler(info.clone()).await;
                if let Some(info) = &info {
                    self.apply_headers(info, response.headers_mut());
                }
                Ok(response)
            }
        }
    }
}

impl<R> fmt::Debug for Guard<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("limiter", &self.limiter)
            .field("rule", &self.rule)
            .field("rejects", &self.over_limit.is_some())
            .field("inject_headers", &self.inject_headers)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}
