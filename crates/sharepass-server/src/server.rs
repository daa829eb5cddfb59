use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    engine::{Limits, ShareService},
    error::ShareError,
    handlers::{health, redeem, share_generated, share_password},
    ratelimit::{rate_limit, RateLimiter},
    store::{crypto::EncryptionKey, Store},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub audit_retention_days: u64,
    /// Requests per minute per client IP; 0 disables limiting.
    pub rate_limit_per_minute: u32,
    /// Number of reverse proxies in front of the server; 0 ignores `X-Forwarded-For`.
    pub trusted_proxy_depth: usize,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = Limits::default();
        Self {
            host: std::env::var("SHAREPASS_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("SHAREPASS_PORT").unwrap_or(8080),
            data_dir: std::env::var("SHAREPASS_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(300),
            cors_origins: std::env::var("SHAREPASS_CORS_ORIGINS").ok(),
            audit_retention_days: env_parse("SHAREPASS_AUDIT_RETENTION_DAYS").unwrap_or(30),
            rate_limit_per_minute: env_parse("SHAREPASS_RATE_LIMIT").unwrap_or(60),
            trusted_proxy_depth: env_parse("SHAREPASS_TRUSTED_PROXY_DEPTH").unwrap_or(0),
            limits: Limits {
                max_views: env_parse("SHAREPASS_MAX_VIEWS").unwrap_or(defaults.max_views),
                max_secret_len: env_parse("SHAREPASS_MAX_SECRET_LEN")
                    .unwrap_or(defaults.max_secret_len),
                ..defaults
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the encryption key from `SECRET_KEY_FILE` (preferred) or `SECRET_KEY`.
/// Prefer the file in production; env vars are visible via
/// `docker inspect` and `/proc`.
pub fn resolve_secret_key() -> Result<EncryptionKey, ShareError> {
    if let Ok(path) = std::env::var("SECRET_KEY_FILE") {
        let encoded = read_key_file(Path::new(&path))
            .map_err(|e| ShareError::Configuration(format!("{e:#}")))?;
        if std::env::var("SECRET_KEY").is_ok() {
            warn!("both SECRET_KEY and SECRET_KEY_FILE are set; using file");
        }
        return EncryptionKey::from_encoded(&encoded);
    }
    let encoded = std::env::var("SECRET_KEY").map_err(|_| {
        ShareError::Configuration("SECRET_KEY or SECRET_KEY_FILE must be set".into())
    })?;
    EncryptionKey::from_encoded(&encoded)
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    // The key is checked before any storage is touched.
    let key = resolve_secret_key().context("load encryption key")?;

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let db_path = data_dir.join("sharepass.db");
    let store = Store::open(&db_path).context("open store")?;

    store.clone().spawn_sweep(cfg.sweep_interval);
    let retention_secs = (cfg.audit_retention_days * 86400) as i64;
    store
        .clone()
        .spawn_audit_sweep(cfg.sweep_interval, retention_secs);

    info!(
        max_views = cfg.limits.max_views,
        max_ttl_days = cfg.limits.max_ttl.num_days(),
        rate_limit_per_minute = cfg.rate_limit_per_minute,
        trusted_proxy_depth = cfg.trusted_proxy_depth,
        "lifecycle limits"
    );

    let state = AppState {
        service: ShareService::new(store, key, cfg.limits),
        limiter: RateLimiter::per_minute(cfg.rate_limit_per_minute),
        trusted_proxy_depth: cfg.trusted_proxy_depth,
    };

    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "sharepass server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// Assemble the HTTP surface: share routes behind rate limiting, CORS,
/// no-store/security headers and request tracing.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let share = Router::new()
        .route("/share/password", post(share_password))
        .route("/share/generate", post(share_generated))
        .route("/share/{token}", post(redeem))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(share)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<HeaderValue> =
                o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
