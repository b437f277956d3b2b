//! LLM Key Proxy
//!
//! Single-binary Rust service that:
//! 1. Fronts an OpenAI-compatible LLM API under `/api/v1`
//! 2. Rotates requests across a pool of upstream API keys
//! 3. Parks keys the upstream reports as rate limited until they recover
//! 4. Relays responses, including live event streams

mod access;
mod catalog;
mod config;
mod error;
mod metrics;
mod proxy;
mod route;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use key_pool::KeyPool;
use relay::{CompletionClient, PassthroughRelay, StructuredRelay};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::access::AccessControl;
use crate::config::Config;
use crate::error::RequestError;
use crate::proxy::ProxyState;

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/{*path}", any(proxy_handler))
        .fallback(not_found_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire the pool and both relays from loaded configuration.
fn build_proxy_state(config: &mut Config) -> Result<ProxyState> {
    let keys = std::mem::take(&mut config.pool.keys);
    let pool = KeyPool::new(keys, config.cooldown()).context("failed to build key pool")?;

    let access = AccessControl::new(config.access.key.take());
    if access.is_open() {
        warn!("no access key configured, every client is allowed through");
    }

    let http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let upstream_url = &config.proxy.upstream_url;

    Ok(ProxyState {
        pool: Arc::new(pool),
        access,
        structured: Arc::new(StructuredRelay::new(CompletionClient::new(
            http.clone(),
            upstream_url,
        ))),
        passthrough: Arc::new(PassthroughRelay::new(http, upstream_url)),
        free_only: config.catalog.free_only,
        google_model_cooldown: config.google_model_cooldown(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting llm-key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        keys = config.pool.keys.len(),
        cooldown_secs = config.pool.cooldown_secs,
        free_only = config.catalog.free_only,
        "configuration loaded"
    );

    let listen_addr = config.proxy.listen_addr;
    let max_connections = config.proxy.max_connections;
    let app_state = AppState {
        proxy: build_proxy_state(&mut config)?,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT bounds the drain so a slow stream cannot block exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    // The drain timer starts at signal receipt
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness probe; never touches the key pool.
async fn health_handler() -> &'static str {
    "ok"
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_eligible_keys(state.proxy.pool.eligible_count().await);
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Relays everything under `/api/v1` upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::forward(&state.proxy, request, new_request_id()).await
}

async fn not_found_handler(uri: axum::http::Uri) -> Response {
    RequestError::NotFound(uri.path().to_string()).into_response(&new_request_id())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use serde_json::{Value, json};
    use futures_util::StreamExt;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    struct TestSetup<'a> {
        upstream_url: &'a str,
        keys: &'a [&'a str],
        access_key: Option<&'a str>,
        free_only: bool,
        google_model_cooldown: Duration,
    }

    impl<'a> TestSetup<'a> {
        fn new(upstream_url: &'a str) -> Self {
            Self {
                upstream_url,
                keys: &["sk-or-a", "sk-or-b"],
                access_key: None,
                free_only: false,
                google_model_cooldown: Duration::ZERO,
            }
        }

        fn state(&self) -> AppState {
            let keys = self.keys.iter().map(|k| Secret::new(k.to_string())).collect();
            let http = reqwest::Client::new();
            AppState {
                proxy: ProxyState {
                    pool: Arc::new(KeyPool::new(keys, Duration::from_secs(60)).unwrap()),
                    access: AccessControl::new(
                        self.access_key.map(|k| Secret::new(k.to_string())),
                    ),
                    structured: Arc::new(StructuredRelay::new(CompletionClient::new(
                        http.clone(),
                        self.upstream_url,
                    ))),
                    passthrough: Arc::new(PassthroughRelay::new(http, self.upstream_url)),
                    free_only: self.free_only,
                    google_model_cooldown: self.google_model_cooldown,
                },
                prometheus: test_prometheus_handle(),
            }
        }

        fn router(&self) -> Router {
            build_router(self.state(), 1000)
        }
    }

    /// Serve `app` on an ephemeral port; returns its base URL with the API prefix.
    async fn start_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/v1")
    }

    /// Mock upstream that echoes method, path, query and authorization as JSON
    /// and counts the requests it served.
    async fn start_echo_server() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().fallback(move |request: Request<Body>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let auth = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                axum::Json(json!({
                    "method": request.method().as_str(),
                    "path": request.uri().path(),
                    "query": request.uri().query(),
                    "authorization": auth,
                }))
            }
        });
        (start_upstream(app).await, hits)
    }

    /// Upstream on a port nothing listens on.
    async fn dead_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/api/v1")
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[tokio::test]
    async fn health_returns_static_ok() {
        let app = TestSetup::new("http://unused").router();
        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let app = TestSetup::new("http://unused").router();
        let response = app.oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let app = TestSetup::new("http://unused").router();
        let response = app.oneshot(get("/v2/whatever")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
    }

    #[tokio::test]
    async fn generic_route_rotates_keys_and_keeps_query() {
        let (upstream_url, _hits) = start_echo_server().await;
        let setup = TestSetup::new(&upstream_url);
        let app = setup.router();

        let first = body_json(
            app.clone()
                .oneshot(get("/api/v1/generation?id=gen-1"))
                .await
                .unwrap(),
        )
        .await;
        let second = body_json(app.oneshot(get("/api/v1/generation")).await.unwrap()).await;

        assert_eq!(first["path"], "/api/v1/generation");
        assert_eq!(first["query"], "id=gen-1");
        assert_eq!(first["authorization"], "Bearer sk-or-a");
        assert_eq!(second["authorization"], "Bearer sk-or-b");
    }

    #[tokio::test]
    async fn missing_access_key_is_rejected_before_upstream() {
        let (upstream_url, hits) = start_echo_server().await;
        let mut setup = TestSetup::new(&upstream_url);
        setup.access_key = Some("proxy-secret");
        let app = setup.router();

        let response = app.clone().oneshot(get("/api/v1/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let authorized = Request::builder()
            .uri("/api/v1/models")
            .header("authorization", "Bearer proxy-secret")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(
            json["authorization"], "Bearer sk-or-a",
            "client access key must be replaced by a pool key"
        );
    }

    #[tokio::test]
    async fn public_route_skips_access_check_and_pool() {
        let (upstream_url, _hits) = start_echo_server().await;
        let mut setup = TestSetup::new(&upstream_url);
        setup.access_key = Some("proxy-secret");
        let app = setup.router();

        let response = app.oneshot(get("/api/v1/providers")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["path"], "/api/v1/providers");
        assert!(json["authorization"].is_null());
    }

    #[tokio::test]
    async fn catalog_is_filtered_when_free_only() {
        let upstream = Router::new().route(
            "/api/v1/models",
            axum::routing::get(|| async {
                axum::Json(json!({
                    "data": [
                        {"id": "free/a", "pricing": {"prompt": "0", "completion": "0"}},
                        {"id": "paid/b", "pricing": {"prompt": "0.001", "completion": "0"}}
                    ]
                }))
            }),
        );
        let upstream_url = start_upstream(upstream).await;

        let mut setup = TestSetup::new(&upstream_url);
        let unfiltered = body_json(setup.router().oneshot(get("/api/v1/models")).await.unwrap()).await;
        assert_eq!(unfiltered["data"].as_array().unwrap().len(), 2);

        setup.free_only = true;
        let filtered = body_json(setup.router().oneshot(get("/api/v1/models")).await.unwrap()).await;
        let data = filtered["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "free/a");
    }

    #[tokio::test]
    async fn unsupported_completion_path_is_400_before_upstream() {
        let (upstream_url, hits) = start_echo_server().await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app
            .oneshot(post_json("/api/v1/chat/completions/extra", json!({"model": "m"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_json_completion_body_is_400() {
        let (upstream_url, hits) = start_echo_server().await;
        let app = TestSetup::new(&upstream_url).router();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/chat/completions")
            .body(Body::from("not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "proxy_error");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mistyped_completion_body_is_rejected_without_taking_a_key() {
        let (upstream_url, hits) = start_echo_server().await;
        let mut setup = TestSetup::new(&upstream_url);
        setup.google_model_cooldown = Duration::from_secs(60);
        let state = setup.state();
        let pool = Arc::clone(&state.proxy.pool);
        let app = build_router(state, 1000);
        let body = json!({"model": "google/gemini-pro", "messages": [], "max_tokens": "lots"});

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/chat/completions", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(pool.eligible_count().await, 2, "no key may be parked");

        // With every key parked the rejection must still be immediate.
        pool.penalize(&Secret::new("sk-or-a".to_string()), None).await;
        pool.penalize(&Secret::new("sk-or-b".to_string()), None).await;
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            app.oneshot(post_json("/api/v1/chat/completions", body)),
        )
        .await
        .expect("rejection waited on the key pool")
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_completion_leaves_rotation_untouched() {
        let (upstream_url, _hits) = start_echo_server().await;
        let app = TestSetup::new(&upstream_url).router();

        let rejected = app
            .clone()
            .oneshot(post_json(
                "/api/v1/chat/completions",
                json!({"model": "m", "messages": "not a list", "temperature": "hot"}),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let next = body_json(app.oneshot(get("/api/v1/generation")).await.unwrap()).await;
        assert_eq!(next["authorization"], "Bearer sk-or-a");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_500() {
        let upstream_url = dead_upstream().await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app.oneshot(get("/api/v1/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn structured_completion_is_relayed() {
        let upstream = Router::new().route(
            "/api/v1/chat/completions",
            axum::routing::post(|axum::Json(body): axum::Json<Value>| async move {
                axum::Json(json!({"id": "gen-1", "model": body["model"]}))
            }),
        );
        let upstream_url = start_upstream(upstream).await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app
            .oneshot(post_json(
                "/api/v1/chat/completions",
                json!({"model": "mistralai/mistral-7b-instruct:free", "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], "gen-1");
        assert_eq!(json["model"], "mistralai/mistral-7b-instruct:free");
    }

    #[tokio::test]
    async fn structured_stream_is_reencoded_as_events() {
        let upstream = Router::new().route(
            "/api/v1/chat/completions",
            axum::routing::post(|| async {
                axum::http::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from(": keepalive\n\ndata: {\"id\":1}\n\ndata: [DONE]\n\n"))
                    .unwrap()
            }),
        );
        let upstream_url = start_upstream(upstream).await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app
            .oneshot(post_json(
                "/api/v1/chat/completions",
                json!({"model": "m", "messages": [], "stream": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            body_bytes(response).await,
            "data: {\"id\":1}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn passthrough_stream_is_relayed_byte_for_byte() {
        let upstream = Router::new().route(
            "/api/v1/responses",
            axum::routing::post(|| async {
                axum::http::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from(":hi\n\na:1\n\n"))
                    .unwrap()
            }),
        );
        let upstream_url = start_upstream(upstream).await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app
            .oneshot(post_json("/api/v1/responses", json!({"input": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, ":hi\n\na:1\n\n");
    }

    #[tokio::test]
    async fn mid_stream_rate_limit_parks_the_key() {
        let upstream = Router::new().route(
            "/api/v1/chat/completions",
            axum::routing::post(|| async {
                axum::http::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from(
                        "data: {\"id\":1}\n\ndata: {\"error\":{\"code\":429,\"message\":\"Rate limit exceeded\"}}\n\n",
                    ))
                    .unwrap()
            }),
        );
        let upstream_url = start_upstream(upstream).await;
        let state = TestSetup::new(&upstream_url).state();
        let pool = Arc::clone(&state.proxy.pool);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json(
                "/api/v1/chat/completions",
                json!({"model": "m", "messages": [], "stream": true}),
            ))
            .await
            .unwrap();
        let body = body_bytes(response).await;
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with("data: {\"id\":1}\n\n"));
        assert!(text.ends_with("}}\n\n"));
        assert!(text.contains("Rate limit exceeded"));
        assert!(!text.contains("[DONE]"));
        assert_eq!(pool.eligible_count().await, 1);
    }

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_upstream_read() {
        let upstream_dropped = Arc::new(AtomicBool::new(false));
        let upstream = {
            let upstream_dropped = Arc::clone(&upstream_dropped);
            Router::new().route(
                "/api/v1/stream",
                axum::routing::get(move || {
                    let flag = DropFlag(Arc::clone(&upstream_dropped));
                    async move {
                        let ticks = async_stream::stream! {
                            let _flag = flag;
                            loop {
                                yield Ok::<_, Infallible>(bytes::Bytes::from_static(b"data: tick\n\n"));
                                tokio::time::sleep(Duration::from_millis(20)).await;
                            }
                        };
                        axum::http::Response::builder()
                            .header("content-type", "text/event-stream")
                            .body(Body::from_stream(ticks))
                            .unwrap()
                    }
                }),
            )
        };
        let upstream_url = start_upstream(upstream).await;
        let app = TestSetup::new(&upstream_url).router();

        let response = app.oneshot(get("/api/v1/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first, "data: tick\n\n");
        assert!(!upstream_dropped.load(Ordering::SeqCst));

        drop(body);

        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            while !upstream_dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(stopped.is_ok(), "upstream kept streaming after the client left");
    }

    #[tokio::test]
    async fn rate_limited_single_key_waits_only_for_the_rest_of_the_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reset_at = Arc::new(Mutex::new(0u64));
        let last_served_at = Arc::new(Mutex::new(0u64));
        let upstream = {
            let calls = Arc::clone(&calls);
            let reset_at = Arc::clone(&reset_at);
            let last_served_at = Arc::clone(&last_served_at);
            Router::new().fallback(move || {
                let calls = Arc::clone(&calls);
                let reset_at = Arc::clone(&reset_at);
                let last_served_at = Arc::clone(&last_served_at);
                async move {
                    *last_served_at.lock().unwrap() = now_millis();
                    if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                        let reset = now_millis() + 2000;
                        *reset_at.lock().unwrap() = reset;
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            [("x-ratelimit-reset", reset.to_string())],
                            r#"{"error":{"code":429,"message":"Rate limit exceeded"}}"#,
                        )
                            .into_response()
                    } else {
                        (StatusCode::OK, r#"{"ok":true}"#).into_response()
                    }
                }
            })
        };
        let upstream_url = start_upstream(upstream).await;

        let mut setup = TestSetup::new(&upstream_url);
        setup.keys = &["sk-or-only"];
        let app = setup.router();

        let first = app.clone().oneshot(get("/api/v1/key")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(get("/api/v1/key")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(
            String::from_utf8_lossy(&body_bytes(second).await).contains("Rate limit exceeded"),
            "upstream error body must be relayed verbatim"
        );

        // Partway into the two-second window.
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let started = tokio::time::Instant::now();
        let third = app.oneshot(get("/api/v1/key")).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(third.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let reset = *reset_at.lock().unwrap();
        assert!(
            *last_served_at.lock().unwrap() + 5 >= reset,
            "third call must not reach upstream before the reset time"
        );
        assert!(
            waited >= Duration::from_millis(600) && waited < Duration::from_millis(1900),
            "third call should wait only for the rest of the window, waited {waited:?}"
        );
    }
}
