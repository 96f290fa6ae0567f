//! `X-RateLimit-*` response headers.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::ratelimit::RateLimitInfo;

/// The quota applied to the request.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Operations left in the window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Unix timestamp at which the window resets.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

impl RateLimitInfo {
    /// Write the rate limit headers into `headers`, if this decision emits them.
    ///
    /// Returns whether anything was written.
    pub fn apply_headers(&self, headers: &mut HeaderMap) -> bool {
        if !self.emit_headers {
            return false;
        }
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
        true
    }
}
