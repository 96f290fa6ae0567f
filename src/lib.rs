//! Turnstile - Fixed-Window Rate Limiting
//!
//! This crate decides whether a caller has used up its quota of operations
//! within a time window. Counting happens in a pluggable [`backend`]
//! (in-process, Redis, or any get/set cache), the [`ratelimit::Limiter`]
//! turns an identity and a scope into a decision, and the [`guard`] module
//! wires that decision into request handling.

pub mod backend;
pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
