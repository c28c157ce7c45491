//! Tollgate - Shared-Store Sliding-Window Rate Limiter
//!
//! This crate enforces per-client, per-category request quotas across a fleet
//! of stateless request handlers. Instances share nothing but a counted-request
//! store; each decision is a count query over a trailing window, and any store
//! failure lets the request through.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
