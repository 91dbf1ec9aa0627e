//! Axum HTTP server: WebSocket and long-poll channels, health, metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::context::ServerContext;
use crate::health::{self, HealthResponse};
use crate::longpoll::{lp_get, lp_post};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handler::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: ServerContext,
    /// Renders `/metrics`; absent when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl FromRef<AppState> for ServerContext {
    fn from_ref(state: &AppState) -> Self {
        state.ctx.clone()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(ctx: ServerContext, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState {
        ctx,
        metrics,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/v0/channels", get(ws_handler))
        .route("/v0/channels/lp", get(lp_get).post(lp_post))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener and serve in the background.
pub async fn start(ctx: ServerContext, metrics: Option<PrometheusHandle>) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(&ctx.config.listen).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(ctx.clone(), metrics);

    let coordinator = ShutdownCoordinator::new();
    let token = coordinator.token();
    let server = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(addr = %local_addr, "parley server started");
    Ok(ServerHandle {
        local_addr,
        ctx,
        coordinator,
        server,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    ctx: ServerContext,
    coordinator: ShutdownCoordinator,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Stop accepting connections, stop every topic, notify every session,
    /// then wait for the listener task.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        self.ctx.shutdown().await;
        let timeout = self.ctx.config.shutdown_timeout;
        self.coordinator.graceful_shutdown(vec![self.server], timeout).await;
        info!("parley server stopped");
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = &state.ctx;
    Json(health::health_check(
        state.start_time,
        ctx.hub.is_shutting_down(),
        ctx.sessions.len(),
        ctx.hub.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("ctx", &self.ctx)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use parley_core::MemoryStore;
    use tower::ServiceExt;

    fn context() -> ServerContext {
        ServerContext::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let ctx = context();
        let _sess = ctx.sessions.create(crate::session::Transport::None, None);
        let (status, body) = get_body(build_router(ctx, None), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["sessions"], 1);
        assert_eq!(parsed["topics"], 0);
        assert!(parsed.get("uptime_secs").is_some());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let (status, _) = get_body(build_router(context(), None), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_renders_prometheus_text() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("parley_test_total").increment(3);
        });
        let (status, body) = get_body(build_router(context(), Some(handle)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("parley_test_total 3"));
    }

    #[tokio::test]
    async fn websocket_route_requires_upgrade() {
        let router = build_router(context(), None)
            .layer(axum::extract::connect_info::MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1))));
        let (status, _) = get_body(router, "/v0/channels").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = get_body(build_router(context(), None), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_and_shuts_down() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config, Arc::new(MemoryStore::new()));
        let handle = start(ctx, None).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        let ctx = handle.context().clone();
        handle.shutdown().await;
        assert!(ctx.hub.is_shutting_down());
    }
}
