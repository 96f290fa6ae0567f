//! Framework-neutral request guard.
//!
//! A [`Guard`] extracts an identity and a scope from each request, asks the
//! [`Limiter`](crate::ratelimit::Limiter) for a decision, and either lets the
//! request through or answers `429 Too Many Requests`. Decisions are handed to
//! the wrapped handler directly; nothing is kept in shared state between
//! requests.

mod headers;
mod interceptor;

pub use headers::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
pub use interceptor::{
    Extractor, Guard, OverLimitFn, Rejection, RequestMeta, Verdict, DEFAULT_REJECTION_BODY,
    UNKNOWN_IDENTITY,
};
