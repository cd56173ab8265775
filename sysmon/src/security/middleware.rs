use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::config::SecurityConfig;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Routes that never require the API key
const AUTH_WHITELIST: &[&str] = &["/health"];

/// Mask a key for logging: first and last four characters only
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return "empty".to_string();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Plain `GET /` or `GET /mcp` without an event-stream Accept returns server info
fn is_server_info(request: &Request) -> bool {
    let path = request.uri().path();
    request.method() == Method::GET
        && (path == "/" || path == "/mcp")
        && !request
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"))
}

/// Check `X-API-Key` against the configured key.
///
/// Requests from user agents matching `allowed_user_agents` prefixes skip the check.
pub async fn auth_middleware(
    State(config): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    if request.method() == Method::OPTIONS
        || AUTH_WHITELIST.iter().any(|w| path == *w)
        || is_server_info(&request)
    {
        return next.run(request).await;
    }

    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if config
        .allowed_user_agents
        .iter()
        .any(|prefix| !prefix.is_empty() && user_agent.starts_with(prefix.as_str()))
    {
        tracing::debug!(path = %path, user_agent = %user_agent, "Trusted user agent, API key check skipped");
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != expected {
        tracing::warn!(
            path = %path,
            method = %request.method(),
            user_agent = %user_agent,
            provided_api_key = %mask_key(provided),
            "Rejected request with invalid API key"
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "API key required",
                "code": "AUTH_INVALID_API_KEY"
            })),
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app(api_key: Option<&str>) -> Router {
        let config = Arc::new(SecurityConfig {
            api_key: api_key.map(str::to_string),
            allowed_user_agents: vec!["Cursor/".to_string()],
        });
        Router::new()
            .route("/", get(|| async { "info" }).post(|| async { "rpc" }))
            .route("/health", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(config, auth_middleware))
    }

    async fn status(app: Router, request: axum::http::Request<Body>) -> StatusCode {
        app.oneshot(request).await.unwrap().status()
    }

    fn post(headers: &[(&str, &str)]) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method("POST").uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "empty");
        assert_eq!(mask_key("short"), "***");
        assert_eq!(mask_key("mcp-secret-key-2025"), "mcp-***2025");
    }

    #[tokio::test]
    async fn test_no_key_configured_allows_all() {
        assert_eq!(status(app(None), post(&[])).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_key_required() {
        assert_eq!(status(app(Some("secret")), post(&[])).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(app(Some("secret")), post(&[("X-API-Key", "wrong")])).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(app(Some("secret")), post(&[("X-API-Key", "secret")])).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_trusted_user_agent_and_exempt_routes() {
        assert_eq!(
            status(app(Some("secret")), post(&[("User-Agent", "Cursor/1.2")])).await,
            StatusCode::OK
        );

        let health = axum::http::Request::get("/health").body(Body::empty()).unwrap();
        assert_eq!(status(app(Some("secret")), health).await, StatusCode::OK);

        let info = axum::http::Request::get("/").body(Body::empty()).unwrap();
        assert_eq!(status(app(Some("secret")), info).await, StatusCode::OK);

        let stream = axum::http::Request::get("/")
            .header("Accept", "text/event-stream")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app(Some("secret")), stream).await, StatusCode::UNAUTHORIZED);
    }
}
