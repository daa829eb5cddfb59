//! End-to-end tests for the share endpoints, driven through the full router.

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sharepass_server::{
    build_router,
    ratelimit::RateLimiter,
    store::{crypto::EncryptionKey, AuditQuery, NewSecret, Store},
    AppState, Limits, ShareService,
};
use tempfile::TempDir;
use tower::ServiceExt;

const PEER: &str = "198.51.100.7:52000";

struct TestApp {
    state: AppState,
    _dir: TempDir,
}

impl TestApp {
    fn new(rate_limit_per_minute: u32) -> Self {
        Self::with_proxy_depth(rate_limit_per_minute, 0)
    }

    fn with_proxy_depth(rate_limit_per_minute: u32, trusted_proxy_depth: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("sharepass.db")).expect("open store");
        let state = AppState {
            service: ShareService::new(store, EncryptionKey::generate(), Limits::default()),
            limiter: RateLimiter::per_minute(rate_limit_per_minute),
            trusted_proxy_depth,
        };
        Self { state, _dir: dir }
    }

    fn router(&self) -> Router {
        build_router(self.state.clone(), None)
    }

    async fn post(&self, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        send(self.router(), post_request(uri, body, None)).await
    }

    async fn post_raw(&self, uri: &str, body: &'static str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .extension(ConnectInfo(peer()))
            .body(Body::from(body))
            .expect("request");
        send(self.router(), request).await
    }

    async fn audit_actions(&self) -> Vec<String> {
        self.state
            .service
            .store()
            .list_audit(&AuditQuery::default())
            .expect("audit")
            .into_iter()
            .map(|e| e.action)
            .collect()
    }
}

fn peer() -> SocketAddr {
    PEER.parse().expect("peer addr")
}

fn post_request(uri: &str, body: Option<Value>, forwarded_for: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .extension(ConnectInfo(peer()));
    if let Some(xff) = forwarded_for {
        builder = builder.header("x-forwarded-for", xff);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request")
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test]
async fn share_then_redeem_once() {
    let app = TestApp::new(0);

    let (status, created) = app
        .post("/share/password", Some(json!({"password": "hunter2"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = created["token"].as_str().expect("token").to_owned();
    assert_eq!(token.len(), 43);
    assert_eq!(created["views_left"], 1);
    assert!(created["created_at"].is_string());
    assert!(created["expire_at"].is_string());
    assert!(created.get("password").is_none());
    assert!(created.get("ciphertext").is_none());

    let (status, revealed) = app.post(&format!("/share/{token}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revealed["password"], "hunter2");
    assert_eq!(revealed["token"], token.as_str());
    assert_eq!(revealed["views_left"], 0);

    let (status, body) = app.post(&format!("/share/{token}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn multi_view_secret_counts_down() {
    let app = TestApp::new(0);
    let (_, created) = app
        .post(
            "/share/password",
            Some(json!({"password": "pw", "views_left": 3})),
        )
        .await;
    let uri = format!("/share/{}", created["token"].as_str().unwrap());

    for remaining in [2, 1, 0] {
        let (status, revealed) = app.post(&uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(revealed["views_left"], remaining);
    }
    let (status, _) = app.post(&uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generate_uses_defaults() {
    let app = TestApp::new(0);
    let (status, created) = app.post("/share/generate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let uri = format!("/share/{}", created["token"].as_str().unwrap());
    let (status, revealed) = app.post(&uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revealed["password"].as_str().unwrap().chars().count(), 16);
}

#[tokio::test]
async fn generate_rejects_bad_size() {
    let app = TestApp::new(0);
    let (status, body) = app
        .post("/share/generate", Some(json!({"size": 2})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("size"));
}

#[tokio::test]
async fn malformed_bodies_are_json_400s() {
    let app = TestApp::new(0);

    let cases = [
        json!({"password": "p", "expire_at": "soon"}),
        json!({}),
        json!({"password": "p", "views_left": -1}),
        json!({"password": 42}),
    ];
    for body in cases {
        let (status, response) = app.post("/share/password", Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert!(response["error"].is_string(), "body: {body}");
    }

    let (status, response) = app
        .post("/share/generate", Some(json!({"size": "big"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].is_string());

    let (status, response) = app.post_raw("/share/password", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].is_string());

    // No content type at all.
    let (status, response) = app.post("/share/generate", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].is_string());
}

#[tokio::test]
async fn expire_at_window_is_validated() {
    let app = TestApp::new(0);

    let too_far = (Utc::now() + Duration::days(8)).to_rfc3339();
    let (status, _) = app
        .post(
            "/share/password",
            Some(json!({"password": "pw", "expire_at": too_far})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
    let (status, _) = app
        .post(
            "/share/password",
            Some(json!({"password": "pw", "expire_at": past})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let soon = (Utc::now() + Duration::hours(2)).format("%Y-%m-%dT%H:%M:%S").to_string();
    let (status, created) = app
        .post(
            "/share/password",
            Some(json!({"password": "pw", "expire_at": soon})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(created["expire_at"].as_str().unwrap().starts_with(&soon));
}

#[tokio::test]
async fn expired_secret_is_gone() {
    let app = TestApp::new(0);
    let (_, created) = app
        .post("/share/password", Some(json!({"password": "pw"})))
        .await;
    let token = created["token"].as_str().unwrap();

    // Rewrite the record as already expired, bypassing creation checks.
    let store = app.state.service.store();
    let record = store.find_by_token(token).unwrap().unwrap();
    store.delete(token).unwrap();
    let reinserted = store
        .insert(NewSecret {
            ciphertext: record.ciphertext.clone(),
            created_at: record.created_at,
            expire_at: Utc::now().timestamp() - 10,
            views_left: record.views_left,
        })
        .unwrap();

    let (status, body) = app
        .post(&format!("/share/{}", reinserted.token), None)
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "secret has expired");

    let (status, _) = app
        .post(&format!("/share/{}", reinserted.token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_token_is_404() {
    let app = TestApp::new(0);
    let (status, _) = app.post("/share/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rate_limit_returns_429() {
    let app = TestApp::new(2);
    for _ in 0..2 {
        let (status, _) = app.post("/share/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let (status, body) = app.post("/share/nope", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "too many requests");
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_the_limit() {
    let app = TestApp::new(2);
    let mut statuses = Vec::new();
    for i in 0..10 {
        let request = post_request(
            "/share/password",
            Some(json!({"password": "pw"})),
            Some(&format!("203.0.113.{i}")),
        );
        statuses.push(send(app.router(), request).await.0);
    }
    let created = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    let limited = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(created, 2);
    assert_eq!(limited, 8);
}

#[tokio::test]
async fn trusted_proxy_hop_is_the_client() {
    let app = TestApp::with_proxy_depth(1, 1);

    let from = |client: &str| {
        post_request(
            "/share/password",
            Some(json!({"password": "pw"})),
            Some(&format!("10.9.9.9, {client}")),
        )
    };
    assert_eq!(send(app.router(), from("203.0.113.1")).await.0, StatusCode::CREATED);
    assert_eq!(send(app.router(), from("203.0.113.2")).await.0, StatusCode::CREATED);
    assert_eq!(
        send(app.router(), from("203.0.113.1")).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );

    let events = app
        .state
        .service
        .store()
        .list_audit(&AuditQuery::default())
        .unwrap();
    let ips: Vec<&str> = events.iter().map(|e| e.source_ip.as_str()).collect();
    assert_eq!(ips, ["203.0.113.2", "203.0.113.1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_have_one_winner() {
    let app = TestApp::new(0);
    let (_, created) = app
        .post("/share/password", Some(json!({"password": "once"})))
        .await;
    let uri = format!("/share/{}", created["token"].as_str().unwrap());

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let router = app.router();
            let request = post_request(&uri, None, None);
            tokio::spawn(send(router, request))
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap().0);
    }
    let winners = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(winners, 1);
    assert!(statuses
        .iter()
        .all(|s| *s == StatusCode::OK || *s == StatusCode::NOT_FOUND));
}

#[tokio::test]
async fn responses_are_not_cacheable() {
    let app = TestApp::new(0);
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
}

#[tokio::test]
async fn requests_are_audited_without_full_tokens() {
    let app = TestApp::new(0);
    let (_, created) = app
        .post("/share/password", Some(json!({"password": "pw"})))
        .await;
    let token = created["token"].as_str().unwrap().to_owned();
    app.post(&format!("/share/{token}"), None).await;
    app.post(&format!("/share/{token}"), None).await;

    assert_eq!(
        app.audit_actions().await,
        ["share.denied", "share.burned", "share.create"]
    );

    let events = app
        .state
        .service
        .store()
        .list_audit(&AuditQuery::default())
        .unwrap();
    assert!(events.iter().all(|e| e.source_ip == "198.51.100.7"));
    assert!(events
        .iter()
        .filter_map(|e| e.token_hint.as_deref())
        .all(|hint| hint.len() < token.len() && token.starts_with(hint)));
}
