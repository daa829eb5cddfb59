use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::warn;

use crate::{
    engine::{GeneratePolicy, ShareOptions},
    error::ShareError,
    ratelimit::ClientIp,
    store::audit::{
        token_hint, AuditEvent, ACTION_SHARE_BURNED, ACTION_SHARE_CREATE, ACTION_SHARE_DENIED,
        ACTION_SHARE_GENERATE, ACTION_SHARE_READ,
    },
    AppState,
};

// ── Extractors ────────────────────────────────────────────────────────────────

/// JSON body whose rejections come back as `400 {"error": ..}`.
pub struct ShareJson<T>(pub T);

impl<S, T> FromRequest<S> for ShareJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ShareError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SharePasswordRequest {
    pub password: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expire_at: Option<DateTime<Utc>>,
    pub views_left: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub size: Option<usize>,
    pub numbers: Option<bool>,
    pub special_char: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expire_at: Option<DateTime<Utc>>,
    pub views_left: Option<u32>,
}

pub async fn share_password(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ShareJson(body): ShareJson<SharePasswordRequest>,
) -> Response {
    let options = ShareOptions {
        expire_at: body.expire_at,
        views_left: body.views_left,
    };
    let created = blocking(move || {
        let created = state.service.share_password(&body.password, options);
        let event = match &created {
            Ok(meta) => AuditEvent::new(
                ACTION_SHARE_CREATE,
                Some(token_hint(&meta.token)),
                ip,
                true,
                Some(format!("views_left={}", meta.views_left)),
            ),
            Err(e) => AuditEvent::new(ACTION_SHARE_CREATE, None, ip, false, Some(e.to_string())),
        };
        audit(&state, event);
        created
    })
    .await;

    match created {
        Ok(meta) => (StatusCode::CREATED, Json(meta)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn share_generated(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ShareJson(body): ShareJson<GenerateRequest>,
) -> Response {
    let defaults = GeneratePolicy::default();
    let policy = GeneratePolicy {
        size: body.size.unwrap_or(defaults.size),
        numbers: body.numbers.unwrap_or(defaults.numbers),
        special_char: body.special_char.unwrap_or(defaults.special_char),
    };
    let options = ShareOptions {
        expire_at: body.expire_at,
        views_left: body.views_left,
    };
    let created = blocking(move || {
        let created = state.service.share_generated(policy, options);
        let event = match &created {
            Ok(meta) => AuditEvent::new(
                ACTION_SHARE_GENERATE,
                Some(token_hint(&meta.token)),
                ip,
                true,
                Some(format!("size={} views_left={}", policy.size, meta.views_left)),
            ),
            Err(e) => AuditEvent::new(ACTION_SHARE_GENERATE, None, ip, false, Some(e.to_string())),
        };
        audit(&state, event);
        created
    })
    .await;

    match created {
        Ok(meta) => (StatusCode::CREATED, Json(meta)).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Redeem ────────────────────────────────────────────────────────────────────

pub async fn redeem(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(token): Path<String>,
) -> Response {
    let revealed = blocking(move || {
        let hint = token_hint(&token);
        let revealed = state.service.redeem(&token);
        let event = match &revealed {
            Ok(revealed) => {
                let action = if revealed.meta.views_left == 0 {
                    ACTION_SHARE_BURNED
                } else {
                    ACTION_SHARE_READ
                };
                AuditEvent::new(
                    action,
                    Some(hint),
                    ip,
                    true,
                    Some(format!("views_left={}", revealed.meta.views_left)),
                )
            }
            Err(e) => {
                let detail = match e {
                    ShareError::NotFound | ShareError::Gone(_) => e.to_string(),
                    _ => "internal error".to_owned(),
                };
                AuditEvent::new(ACTION_SHARE_DENIED, Some(hint), ip, false, Some(detail))
            }
        };
        audit(&state, event);
        revealed
    })
    .await;

    match revealed {
        Ok(revealed) => Json(revealed).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Store work commits (and fsyncs) redb transactions, so it runs on the
/// blocking pool rather than an async worker.
async fn blocking<T, F>(work: F) -> Result<T, ShareError>
where
    F: FnOnce() -> Result<T, ShareError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("store task failed")?
}

/// Audit writes are best-effort and never fail the request.
fn audit(state: &AppState, event: AuditEvent) {
    if let Err(e) = state.service.store().record_audit(event) {
        warn!(error = %e, "failed to record audit event");
    }
}

/// Accepts RFC 3339, or a naive ISO 8601 date-time which is taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    parse_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid ISO 8601 timestamp: {raw}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offset_and_naive_timestamps() {
        let with_offset = parse_timestamp("2030-01-02T03:04:05+02:00").unwrap();
        assert_eq!(with_offset.to_rfc3339(), "2030-01-02T01:04:05+00:00");

        let zulu = parse_timestamp("2030-01-02T03:04:05Z").unwrap();
        assert_eq!(zulu.timestamp(), 1_893_553_445);

        let naive = parse_timestamp("2030-01-02T03:04:05.250").unwrap();
        assert_eq!(naive.timestamp(), zulu.timestamp());

        assert!(parse_timestamp("2030-01-02 03:04:05").is_some());
        assert!(parse_timestamp("tomorrow").is_none());
    }

    #[test]
    fn request_body_defaults() {
        let body: GenerateRequest = serde_json::from_str("{}").unwrap();
        assert!(body.size.is_none() && body.expire_at.is_none());

        let body: SharePasswordRequest =
            serde_json::from_str(r#"{"password":"p","expire_at":null,"views_left":2}"#).unwrap();
        assert_eq!(body.views_left, Some(2));
        assert!(body.expire_at.is_none());

        let bad = serde_json::from_str::<SharePasswordRequest>(
            r#"{"password":"p","expire_at":"soon"}"#,
        );
        assert!(bad.is_err());
    }
}
