//! Per-client token bucket rate limiting.
//!
//! Every request passes through [`rate_limit`], which resolves the client IP,
//! stores it as a [`ClientIp`] extension for handlers, and spends one token
//! from that client's bucket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::AppState;

/// Buckets are swept of idle clients once the map grows past this.
const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    last_refill: Instant,
    refill_rate_per_sec: f64,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_period: Duration) -> Self {
        let refill_rate_per_sec = max_tokens as f64 / refill_period.as_secs_f64();
        Self {
            tokens: max_tokens as f64,
            max_tokens: max_tokens as f64,
            last_refill: Instant::now(),
            refill_rate_per_sec,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }

    /// `Err(retry_after_secs)` when empty.
    fn try_consume(&mut self) -> Result<(), u64> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let seconds_until_refill = (1.0 - self.tokens) / self.refill_rate_per_sec;
            Err(seconds_until_refill.ceil() as u64)
        }
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.max_tokens
    }
}

/// Rate limiter keyed by client IP. A limit of zero disables limiting.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
    max_tokens: u32,
    refill_period: Duration,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_period: Duration) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens,
            refill_period,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn disabled() -> Self {
        Self::per_minute(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_tokens > 0
    }

    /// `Err(retry_after_secs)` when `client` is over its limit.
    pub async fn check(&self, client: &str) -> Result<(), u64> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut buckets = self.buckets.lock().await;

        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(client) {
            let now = Instant::now();
            buckets.retain(|_, bucket| {
                bucket.refill(now);
                !bucket.is_full()
            });
            debug!(tracked = buckets.len(), "evicted idle rate limit buckets");
        }

        buckets
            .entry(client.to_owned())
            .or_insert_with(|| TokenBucket::new(self.max_tokens, self.refill_period))
            .try_consume()
    }
}

/// Resolved client address, attached to every request by [`rate_limit`].
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Resolve the client address for limiting and auditing.
///
/// With `trusted_proxy_depth == 0` only the socket peer counts and forwarding
/// headers are ignored. Otherwise the nth-from-last `X-Forwarded-For` entry is
/// used, where depth 1 is the hop appended by the nearest trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<&SocketAddr>, trusted_proxy_depth: usize) -> String {
    if trusted_proxy_depth > 0 {
        if let Some(ip) = forwarded_for(headers, trusted_proxy_depth) {
            return ip;
        }
    }
    peer.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn forwarded_for(headers: &HeaderMap, depth: usize) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let hops: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();
    hops.get(hops.len().saturating_sub(depth))
        .map(|hop| (*hop).to_owned())
}

/// Axum middleware enforcing the per-client limit.
pub async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), addr.as_ref(), state.trusted_proxy_depth);

    if let Err(retry_after) = state.limiter.check(&ip).await {
        warn!(client = %ip, retry_after, "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "too many requests"})),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}
