use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use tandem_server::config::Config;
use tandem_server::providers::{
    github::GithubScmProvider,
    http::{HttpCallbackService, HttpSandboxProvider},
    NullEnvironmentStore, PlaintextTokenCipher,
};
use tandem_server::session::{ActorDeps, SessionRegistry};
use tandem_server::state::AppState;
use tandem_server::{handlers, websocket};

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
///
/// When `ConnectInfo` is not available (e.g. in direct oneshot tests), access
/// is denied — the metrics route is not registered in the test app anyway.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        Some(_) => StatusCode::NOT_FOUND.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "tandem_server=info,tower_http=info,sqlx=warn"
            .parse()
            .unwrap()
    });

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 Tandem Server starting...");

    let config = Arc::new(Config::from_env().expect("Failed to load configuration"));
    info!("📝 Configuration loaded");

    // Session stores are created lazily, one SQLite database per session.
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .expect("Failed to create session data directory");
    info!("📂 Session data directory: {}", config.data_dir.display());

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client");

    let deps = ActorDeps {
        config: config.clone(),
        sandbox_provider: Arc::new(HttpSandboxProvider::new(
            http_client.clone(),
            config.sandbox_provider_url.clone(),
        )),
        scm: Arc::new(GithubScmProvider::new(
            http_client.clone(),
            config.github_api_url.clone(),
            config.github_app_token.clone(),
        )),
        environment: Arc::new(NullEnvironmentStore),
        callback_service: Arc::new(HttpCallbackService::new(
            http_client,
            config.callback_url.clone(),
        )),
        token_cipher: Arc::new(PlaintextTokenCipher),
    };

    let app_state = AppState {
        config: config.clone(),
        sessions: Arc::new(SessionRegistry::new(deps)),
    };

    // CORS: permissive in dev, origin-restricted in production.
    let cors = if config.is_dev {
        info!("🔓 CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!(
                "🔒 CORS: no ALLOWED_ORIGINS configured — all cross-origin requests will be denied"
            );
        } else {
            info!(
                "🔒 CORS: production mode, allowing origins: {:?}",
                config.allowed_origins
            );
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // ── Rate limiting ─────────────────────────────────────────────────────────
    // Global limit: 20 requests/second per IP, burst of 40. WebSocket
    // upgrades count once; frames inside an accepted socket do not.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .finish()
            .expect("Invalid global governor configuration"),
    );

    let addr = config.server_addr();

    // Build router
    let app = Router::new()
        // Health check + metrics
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        // Session bootstrap and inspection
        .route("/sessions/:session_id/init", post(handlers::init_session))
        .route("/sessions/:session_id/state", get(handlers::get_state))
        // Prompt queue
        .route("/sessions/:session_id/prompt", post(handlers::post_prompt))
        .route("/sessions/:session_id/stop", post(handlers::post_stop))
        // Sandbox event fallback transport
        .route(
            "/sessions/:session_id/sandbox-event",
            post(handlers::post_sandbox_event),
        )
        // Participants
        .route(
            "/sessions/:session_id/participants",
            get(handlers::list_participants).post(handlers::join_participant),
        )
        // History and outputs
        .route("/sessions/:session_id/events", get(handlers::list_events))
        .route(
            "/sessions/:session_id/artifacts",
            get(handlers::list_artifacts),
        )
        .route(
            "/sessions/:session_id/messages",
            get(handlers::list_messages),
        )
        // Pull requests
        .route("/sessions/:session_id/create-pr", post(handlers::create_pr))
        // Tokens and lifecycle toggles
        .route(
            "/sessions/:session_id/ws-token",
            post(handlers::rotate_ws_token),
        )
        .route(
            "/sessions/:session_id/archive",
            post(handlers::archive_session),
        )
        .route(
            "/sessions/:session_id/unarchive",
            post(handlers::unarchive_session),
        )
        .route(
            "/sessions/:session_id/verify-sandbox-token",
            post(handlers::verify_sandbox_token),
        )
        .route(
            "/sessions/:session_id/openai-token-refresh",
            post(handlers::openai_token_refresh),
        )
        // WebSocket gateway: clients and the sandbox
        .route("/sessions/:session_id/ws", get(websocket::client_ws_handler))
        .route(
            "/sessions/:session_id/sandbox/ws",
            get(websocket::sandbox_ws_handler),
        )
        // ── Global rate limit (20 req/s per IP, burst 40) ──────────────────
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Security response headers ──────────────────────────────────────
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        // ── Prometheus + CORS ──────────────────────────────────────────────
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(app_state);

    // Start server
    info!("🎧 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // in request extensions, needed by:
    //  - GovernorLayer's PeerIpKeyExtractor (per-IP rate limiting)
    //  - require_loopback middleware on /metrics
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server failed to start");
}
