//! Rate limiting middleware for axum.
//!
//! Each request is charged against the bucket `"{client}:{route}"`, where the
//! client is the `X-Client-ID` header (or the peer IP) and the route is the
//! matched route pattern (or the raw path). Limiter errors fail closed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};

use crate::ratelimit::{Decision, RateLimiterBackend};

/// Header carrying an explicit client identity.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Tokens left after an admitted request.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Client identity used when neither the header nor the peer address is known.
const UNKNOWN_CLIENT: &str = "unknown";

/// Enforce the limiter on every request passing through this layer.
pub async fn rate_limit<R: RateLimiterBackend + 'static>(
    State(limiter): State<Arc<R>>,
    request: Request,
    next: Next,
) -> Response {
    let key = request_key(&request);

    let decision = match limiter.allow(&key).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(key = %key, error = %e, "Rate limiter unavailable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "rate limiter unavailable" })),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        debug!(key = %key, retry_after_ms = decision.retry_after_ms(), "Request rejected");
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(decision.remaining));
    response
}

/// Build the bucket key for a request.
pub fn request_key<B>(request: &axum::http::Request<B>) -> String {
    let client = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    format!("{client}:{route}")
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after_ms = decision.retry_after_ms();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate limit exceeded",
            "retry_after_ms": retry_after_ms,
        })),
    )
        .into_response();

    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_ms.div_ceil(1000)));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_key_prefers_client_header() {
        let mut request = Request::builder()
            .uri("/resource?page=2")
            .header("X-Client-ID", "alice")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 5000))));

        assert_eq!(request_key(&request), "alice:/resource");
    }

    #[test]
    fn test_key_falls_back_to_peer_ip() {
        let mut request = Request::builder()
            .uri("/resource")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 5000))));

        assert_eq!(request_key(&request), "10.0.0.9:/resource");
    }

    #[test]
    fn test_key_without_peer_or_header() {
        let request = Request::builder()
            .uri("/other")
            .header("X-Client-ID", "")
            .body(Body::empty())
            .unwrap();

        assert_eq!(request_key(&request), "unknown:/other");
    }

    #[test]
    fn test_retry_after_rounds_up_to_seconds() {
        let decision = Decision::deny(0, std::time::Duration::from_millis(12_001));
        let response = too_many_requests(&decision);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "13");
    }
}
