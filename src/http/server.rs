//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers;
use super::middleware::rate_limit;
use crate::error::Result;
use crate::ratelimit::RateLimiterBackend;

/// HTTP server for the rate limited service.
pub struct HttpServer<R: RateLimiterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<R>,
}

impl<R: RateLimiterBackend + 'static> HttpServer<R> {
    pub fn new(addr: SocketAddr, rate_limiter: Arc<R>) -> Self {
        Self { addr, rate_limiter }
    }

    /// The application routes.
    ///
    /// `/healthz` sits outside the limiter; everything routed through the
    /// metered group is charged before the handler runs.
    pub fn router(&self) -> Router {
        let metered = Router::new()
            .route("/resource", get(handlers::resource))
            .route_layer(middleware::from_fn_with_state(
                self.rate_limiter.clone(),
                rate_limit::<R>,
            ));

        Router::new()
            .route("/healthz", get(handlers::healthz))
            .merge(metered)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RateLimiter, TokenBucketConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn server(capacity: u64) -> HttpServer<RateLimiter> {
        let limiter = RateLimiter::with_clock(
            TokenBucketConfig::new(capacity, capacity, Duration::from_secs(60)),
            Arc::new(ManualClock::new(0)),
        );
        HttpServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(limiter))
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-Client-ID", "alice")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz_is_not_metered() {
        let app = server(1).router();

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/healthz")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-remaining").is_none());
        }
    }

    #[tokio::test]
    async fn test_resource_reports_remaining_then_rejects() {
        let app = server(2).router();

        let first = app.clone().oneshot(request("/resource")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        let body = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "protected resource accessed");

        let second = app.clone().oneshot(request("/resource")).await.unwrap();
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

        let third = app.oneshot(request("/resource")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers()["retry-after"], "30");

        let body = to_bytes(third.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "rate limit exceeded");
        assert_eq!(body["retry_after_ms"], 30_000);
    }
}
