use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

pub async fn generate_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        });
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);

    if !state.generate_limiter.check_and_count(&key) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many requests from this IP, please try again later" })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Prefers forwarded headers when the deployment fronts the server with a
/// proxy; otherwise the socket address is authoritative.
fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        for header in ["x-forwarded-for", "x-real-ip"] {
            let candidate = headers
                .get(header)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .unwrap_or_default();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn forwarded_header_wins_when_proxy_is_trusted() {
        let headers = headers_with("x-forwarded-for", "203.0.113.9, 10.0.0.1");
        let socket = "192.168.1.1:9000".parse().ok();
        assert_eq!(client_identity(&headers, socket, true), "203.0.113.9");
    }

    #[test]
    fn forwarded_header_is_ignored_without_proxy_trust() {
        let headers = headers_with("x-forwarded-for", "203.0.113.9");
        let socket = "192.168.1.1:9000".parse().ok();
        assert_eq!(client_identity(&headers, socket, false), "192.168.1.1");
    }

    #[test]
    fn falls_back_to_unknown_without_any_identity() {
        assert_eq!(client_identity(&HeaderMap::new(), None, true), "unknown");
    }
}
