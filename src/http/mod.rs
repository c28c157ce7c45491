//! HTTP surface: the guard middleware for protected handlers and the
//! standalone decision service.

mod guard;
mod server;
mod service;

pub use guard::{enforce, too_many_requests, RateLimitGuard};
pub use server::HttpServer;
pub use service::{router, EvaluateRequest, EvaluateResponse};
