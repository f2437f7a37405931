use std::env;
use std::path::PathBuf;

/// Process-wide configuration, loaded once at startup.
///
/// Every timing knob has a default suitable for production; tests construct
/// `Config::for_tests()` with short windows instead of going through the
/// environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Directory holding one SQLite database per session.
    pub data_dir: PathBuf,
    pub is_dev: bool,
    pub allowed_origins: Vec<String>,

    /// Hard ceiling on a single prompt execution, enforced even if the
    /// sandbox goes silent.
    pub execution_timeout_ms: i64,
    /// Sandbox idle window; the sandbox is stopped once this elapses with no
    /// activity and no connected clients.
    pub inactivity_timeout_ms: i64,
    /// Maximum silence between sandbox heartbeats before it is declared stale.
    pub heartbeat_timeout_ms: i64,
    /// How long an accepted client socket may stay unauthenticated.
    pub client_auth_timeout_ms: u64,
    /// Lifetime of a rotated WS auth token.
    pub ws_token_ttl_ms: i64,
    /// Hard deadline on a branch-push rendezvous.
    pub push_timeout_ms: u64,

    /// Consecutive permanent spawn failures that open the circuit breaker.
    pub spawn_failure_threshold: i64,
    /// How long the breaker stays open once tripped.
    pub spawn_breaker_open_ms: i64,

    /// Base URL of the sandbox provider API. Empty disables real spawning.
    pub sandbox_provider_url: String,
    /// Base URL for best-effort integration callbacks. Empty disables them.
    pub callback_url: String,
    /// GitHub App installation token used for app-level pushes.
    pub github_app_token: String,
    pub github_api_url: String,
    /// Public base URL of the Tandem web app, used in PR body footers and
    /// manual-PR links.
    pub app_base_url: String,
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let is_dev = env::var("APP_ENV").as_deref() != Ok("production");

        // Misconfigured provider endpoints surface at call time anyway, but a
        // boot-time warning is much easier to find.
        for key in ["SANDBOX_PROVIDER_URL", "CALLBACK_URL"] {
            if let Ok(value) = env::var(key) {
                if !value.is_empty() && url::Url::parse(&value).is_err() {
                    tracing::warn!(key, value, "Configured URL does not parse");
                }
            }
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/sessions")),
            is_dev,
            allowed_origins,

            execution_timeout_ms: env_i64("EXECUTION_TIMEOUT_MS", 90 * 60 * 1000),
            inactivity_timeout_ms: env_i64("INACTIVITY_TIMEOUT_MS", 10 * 60 * 1000),
            heartbeat_timeout_ms: env_i64("HEARTBEAT_TIMEOUT_MS", 2 * 60 * 1000),
            client_auth_timeout_ms: env_u64("CLIENT_AUTH_TIMEOUT_MS", 30_000),
            ws_token_ttl_ms: env_i64("WS_TOKEN_TTL_MS", 24 * 60 * 60 * 1000),
            push_timeout_ms: env_u64("PUSH_TIMEOUT_MS", 180_000),

            spawn_failure_threshold: env_i64("SPAWN_FAILURE_THRESHOLD", 3),
            spawn_breaker_open_ms: env_i64("SPAWN_BREAKER_OPEN_MS", 60_000),

            sandbox_provider_url: env::var("SANDBOX_PROVIDER_URL").unwrap_or_default(),
            callback_url: env::var("CALLBACK_URL").unwrap_or_default(),
            github_app_token: env::var("GITHUB_APP_TOKEN").unwrap_or_default(),
            github_api_url: env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "https://tandem.dev".to_string()),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Short windows so watchdog behavior is observable in tests.
    pub fn for_tests() -> Self {
        Config {
            server_host: "127.0.0.1".into(),
            server_port: 0,
            data_dir: std::env::temp_dir().join("tandem_test_sessions"),
            is_dev: true,
            allowed_origins: vec![],
            execution_timeout_ms: 2_000,
            inactivity_timeout_ms: 1_000,
            heartbeat_timeout_ms: 500,
            client_auth_timeout_ms: 200,
            ws_token_ttl_ms: 24 * 60 * 60 * 1000,
            push_timeout_ms: 500,
            spawn_failure_threshold: 3,
            spawn_breaker_open_ms: 60_000,
            sandbox_provider_url: String::new(),
            callback_url: String::new(),
            github_app_token: String::new(),
            github_api_url: "https://api.github.com".into(),
            app_base_url: "https://tandem.test".into(),
        }
    }
}
