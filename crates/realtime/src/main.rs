mod api;
mod auth;
mod config;
mod db;
mod error;
mod metrics;
mod store;
mod tracking;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::jwt::JwtAccessTokenService;
use crate::config::RealtimeConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::RealtimeMetrics;
use crate::store::{RecordStore, TaskPipeline};
use crate::tracking::{
    day::DayBoundary, module_usage::ModuleUsageTracker, presence::PresenceTracker,
    reconciler::StaleSessionReconciler, retry::RetryPolicy,
};
use crate::ws::{dispatch::EventRouter, rooms::RoomRegistry};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RealtimeConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set ATELIER_REALTIME_JWT_SECRET in production");
    }
    if config.relaxed_mode {
        warn!("relaxed mode enabled; abandoned generation tasks will not be released");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid realtime JWT secret")?,
    );
    let (records, tasks) = open_stores(&config).await?;

    let metrics = Arc::new(RealtimeMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let day_boundary = DayBoundary::from_offset(config.day_offset);
    let reconciler = StaleSessionReconciler::new(
        records.clone(),
        tasks,
        config.stale_session_threshold,
        config.relaxed_mode,
    );
    let presence = Arc::new(PresenceTracker::new(
        records.clone(),
        reconciler,
        day_boundary,
        RetryPolicy::default(),
    ));
    let usage =
        Arc::new(ModuleUsageTracker::new(records.clone(), day_boundary, RetryPolicy::default()));
    let rooms = RoomRegistry::default();
    let events = EventRouter::spawn(presence, usage, rooms.clone());

    let app = build_router(
        metrics,
        ws::router(Arc::clone(&jwt_service), events, rooms),
        api::router(records, day_boundary, jwt_service),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind realtime listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting realtime server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("realtime server exited unexpectedly")
}

fn init_tracing(config: &RealtimeConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_stores(config: &RealtimeConfig) -> anyhow::Result<(RecordStore, TaskPipeline)> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("ATELIER_REALTIME_DATABASE_URL not set; usage records are kept in memory only");
        return Ok((RecordStore::in_memory(), TaskPipeline::in_memory()));
    };

    let pool = db::pool::create_pg_pool(database_url, db::pool::PoolConfig::from_env())
        .await
        .context("failed to create usage database pool")?;
    db::pool::check_pool_health(&pool).await.context("usage database health check failed")?;
    db::migrations::run_migrations(&pool).await.context("failed to run usage migrations")?;

    Ok((RecordStore::Postgres(pool.clone()), TaskPipeline::Postgres(pool)))
}

fn build_router(metrics: Arc<RealtimeMetrics>, ws_router: Router, api_router: Router) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(metrics))
            .merge(ws_router)
            .merge(api_router),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<RealtimeMetrics>>) -> Response {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], metrics.render_prometheus()).into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::metrics::RealtimeMetrics;

    fn test_router(metrics: Arc<RealtimeMetrics>) -> Router {
        build_router(metrics, Router::new(), Router::new())
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router(Arc::new(RealtimeMetrics::default()))
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn caller_request_id_is_echoed() {
        let response = test_router(Arc::new(RealtimeMetrics::default()))
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-from-client")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("req-from-client")
        );
    }

    #[tokio::test]
    async fn metrics_route_renders_prometheus_text() {
        let metrics = Arc::new(RealtimeMetrics::default());
        metrics.record_ws_event("usage-time-start", false);

        let response = test_router(Arc::clone(&metrics))
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("metrics request should build"),
            )
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("metrics body should be readable");
        let text = String::from_utf8(body.to_vec()).expect("metrics body should be utf-8");
        assert!(text.contains("realtime_ws_events_total"));
        assert!(text.contains("usage-time-start"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
