//! HTTP surface for the rate limiting service.

mod handlers;
mod middleware;
mod server;

pub use middleware::{rate_limit, request_key, CLIENT_ID_HEADER, X_RATELIMIT_REMAINING};
pub use server::HttpServer;
