pub mod dirs;
pub mod engine;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod ratelimit;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: engine::ShareService,
    pub limiter: ratelimit::RateLimiter,
    /// Proxy hops whose `X-Forwarded-For` entries are believed; 0 trusts only the socket peer.
    pub trusted_proxy_depth: usize,
}

pub use engine::{GeneratePolicy, Limits, Revealed, ShareOptions, ShareService};
pub use error::{GoneReason, ShareError};
pub use server::{build_router, read_key_file, resolve_data_dir, resolve_secret_key, run, ServerConfig};
