use crate::collector::MetricsCollector;
use crate::config::{Config, CorsConfig, StreamConfig};
use crate::mcp::McpHandler;
use crate::security::auth_middleware;
use crate::{Error, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit},
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{self, SESSION_HEADER};
use super::routes;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<McpHandler>,
    pub stream: StreamConfig,
    pub metrics: Option<PrometheusHandle>,
    pub auth_enabled: bool,
    pub started_at: DateTime<Utc>,
}

pub struct ApiServer {
    handler: Arc<McpHandler>,
    config: Config,
    metrics: Option<PrometheusHandle>,
}

impl ApiServer {
    pub fn new(config: Config, collector: Arc<dyn MetricsCollector>) -> Self {
        let handler = Arc::new(McpHandler::with_system_tools(
            config.session.clone(),
            collector,
        ));
        Self {
            handler,
            config,
            metrics: None,
        }
    }

    /// Serve `/metrics` from this recorder handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn handler(&self) -> &Arc<McpHandler> {
        &self.handler
    }

    /// Build CORS layer from configuration
    fn build_cors_layer(cors_config: &CorsConfig) -> CorsLayer {
        if !cors_config.enabled {
            return CorsLayer::new();
        }

        let origins: Vec<HeaderValue> = cors_config
            .origins
            .iter()
            .filter(|o| *o != "*")
            .filter_map(|o| o.parse().ok())
            .collect();

        let has_wildcard = cors_config.origins.iter().any(|o| o == "*");

        let cors = if has_wildcard {
            CorsLayer::new().allow_origin(tower_http::cors::Any)
        } else if origins.is_empty() {
            CorsLayer::new()
        } else {
            CorsLayer::new().allow_origin(origins)
        };

        cors.allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(tower_http::cors::Any)
            .expose_headers([HeaderName::from_static(SESSION_HEADER)])
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            handler: self.handler.clone(),
            stream: self.config.stream.clone(),
            metrics: self.metrics.clone(),
            auth_enabled: self.config.security.enabled(),
            started_at: Utc::now(),
        };
        let security = Arc::new(self.config.security.clone());

        let mcp_routes = Router::new()
            .route(
                "/",
                get(handlers::handle_get)
                    .post(handlers::handle_post)
                    .delete(handlers::handle_delete),
            )
            .route(
                "/mcp",
                get(handlers::handle_get)
                    .post(handlers::handle_post)
                    .delete(handlers::handle_delete),
            )
            .route(
                "/sse",
                get(handlers::handle_legacy_sse).post(handlers::handle_post),
            )
            .route("/metrics", get(routes::metrics))
            .route_layer(middleware::from_fn_with_state(security, auth_middleware));

        let public_routes = Router::new().route("/health", get(routes::health));

        let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let remote = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|c| c.0);
            let user_agent = request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let session_id = request
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            tracing::info_span!(
                "http",
                method = %request.method(),
                path = %request.uri().path(),
                remote = ?remote,
                user_agent = %user_agent,
                session_id = %session_id,
            )
        });

        Router::new()
            .merge(mcp_routes)
            .merge(public_routes)
            .with_state(state)
            .layer(DefaultBodyLimit::max(self.config.server.max_body_size))
            .layer(CatchPanicLayer::new())
            .layer(Self::build_cors_layer(&self.config.server.cors))
            .layer(trace)
    }

    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener, std::future::pending()).await
    }

    /// Serve on a bound listener until `shutdown` resolves.
    ///
    /// On shutdown every session is closed so open streams end.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let sweeper = self.handler.sessions().spawn_sweeper();
        let sessions = self.handler.sessions().clone();

        tracing::info!(
            addr = %local_addr,
            auth = self.config.security.enabled(),
            metrics = self.metrics.is_some(),
            "MCP server listening"
        );

        let router = self.router();
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down, closing sessions");
            sessions.close_all();
        })
        .await
        .map_err(|e| Error::Server(e.to_string()));

        sweeper.abort();
        result
    }
}
