//! End-to-end tests for the middleware pipeline over an in-process router.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    http::{header, Request, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use taskhive_server::{
    apply_pipeline, ApiError, AppConfig, AppState, CacheBackend, PipelineConfig,
};

fn test_state(mutate: impl FnOnce(&mut AppConfig)) -> AppState {
    let mut cfg = AppConfig::default();
    mutate(&mut cfg);
    AppState::new(cfg, CacheBackend::new_local())
}

/// Router with one cacheable read route (counting invocations), one mutating
/// route, one failing route and one large-body route.
fn test_app(state: &AppState, pipeline: PipelineConfig, hits: Arc<AtomicUsize>) -> Router {
    let router = Router::new()
        .route(
            "/api/workspaces/1/tasks",
            get(move || {
                let hits = hits.clone();
                async move {
                    let serve = hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "tasks": ["triage", "review"], "serve": serve }))
                }
            }),
        )
        .route(
            "/api/tasks",
            post(|| async { (StatusCode::CREATED, Json(json!({ "id": 1 }))) }),
        )
        .route(
            "/api/boom",
            get(|| async {
                Err::<Json<Value>, _>(ApiError::Internal(anyhow::anyhow!("kaboom in handler")))
            }),
        )
        .route(
            "/api/report",
            get(|| async { Json(json!({ "data": "x".repeat(4096) })) }),
        )
        .route(
            "/api/stream",
            get(|| async {
                // A body whose stream fails partway through the read.
                let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                    Ok(Bytes::from_static(b"{\"partial\":")),
                    Err(std::io::Error::other("connection reset")),
                ];
                Response::builder()
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from_stream(futures::stream::iter(chunks)))
                    .unwrap()
            }),
        );
    apply_pipeline(router, state, pipeline)
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn get_req(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn security_headers_present_on_success_and_errors() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    for path in ["/api/workspaces/1/tasks", "/no/such/route"] {
        let res = app.clone().oneshot(get_req(path)).await.unwrap();
        let headers = res.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(headers.contains_key("content-security-policy"));
    }
}

#[tokio::test]
async fn unknown_route_gets_structured_json_error() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let res = app.oneshot(get_req("/no/such/route")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn internal_error_detail_attached_outside_production() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let res = app.oneshot(get_req("/api/boom")).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["message"], "An unexpected error occurred");
    assert!(body["detail"].as_str().unwrap().contains("kaboom"));
}

#[tokio::test]
async fn internal_error_detail_hidden_in_production() {
    let state = test_state(|cfg| cfg.server.environment = "production".into());
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let res = app.oneshot(get_req("/api/boom")).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert!(body.get("detail").is_none());
}

#[tokio::test]
async fn errors_recorded_as_zero_duration_metrics() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    app.oneshot(get_req("/api/boom")).await.unwrap();

    let summary = state.monitor.summary(None);
    let error_metric = summary
        .slowest_operations
        .iter()
        .find(|m| m.name == "request.error")
        .expect("error metric recorded");
    assert_eq!(error_metric.duration_ms, 0.0);
    let meta = error_metric.metadata.as_ref().unwrap();
    assert_eq!(meta["path"], json!("/api/boom"));
    assert_eq!(meta["method"], json!("GET"));
    assert_eq!(meta["status"], json!(500));
}

#[tokio::test]
async fn mutating_request_requires_json_content_type() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let req = Request::builder()
        .method("POST")
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Bad Request");

    let req = Request::builder()
        .method("POST")
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn oversized_body_rejected_with_413() {
    let state = test_state(|cfg| cfg.server.body_limit_bytes = 64);
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let payload = "x".repeat(256);
    let req = Request::builder()
        .method("POST")
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len().to_string())
        .body(Body::from(payload))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Payload Too Large");
}

#[tokio::test]
async fn oversized_body_rejected_without_content_length() {
    let state = test_state(|cfg| cfg.server.body_limit_bytes = 64);
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    // No Content-Length header: the limit must bind on the received bytes.
    let payload = format!("{{\"note\":\"{}\"}}", "x".repeat(256));
    let req = Request::builder()
        .method("POST")
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Payload Too Large");
}

#[tokio::test]
async fn body_read_failure_becomes_internal_error_not_truncated_success() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let res = app.oneshot(get_req("/api/stream")).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert!(body["detail"].as_str().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn body_read_failure_during_compression_becomes_internal_error() {
    let state = test_state(|_| {});
    let pipeline = PipelineConfig {
        caching: false,
        ..PipelineConfig::default()
    };
    let app = test_app(&state, pipeline, Arc::new(AtomicUsize::new(0)));

    let req = Request::builder()
        .uri("/api/stream")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(res).await;
    assert_eq!(body["error"], "Internal Server Error");
}

#[tokio::test]
async fn auth_policy_limits_and_reports_retry_after() {
    let state = test_state(|cfg| {
        cfg.rate_limit.auth.max_requests = 3;
        cfg.rate_limit.auth.window_secs = 60;
    });
    let app = test_app(&state, PipelineConfig::auth(), Arc::new(AtomicUsize::new(0)));

    let request = |app: Router| async move {
        app.oneshot(
            Request::builder()
                .uri("/api/workspaces/1/tasks")
                .header("x-forwarded-for", "203.0.113.9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    };

    for expected_remaining in ["2", "1", "0"] {
        let res = request(app.clone()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-ratelimit-limit"], "3");
        assert_eq!(res.headers()["x-ratelimit-remaining"], expected_remaining);
        assert!(res.headers().contains_key("x-ratelimit-reset"));
    }

    let res = request(app.clone()).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["x-ratelimit-remaining"], "0");
    // 429 short-circuits before the chain but still carries security headers.
    assert_eq!(res.headers()["x-frame-options"], "DENY");
    let body = body_json(res).await;
    assert_eq!(body["error"], "Too Many Requests");
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!(retry_after >= 1);
    assert!(retry_after <= 60);
}

#[tokio::test]
async fn rate_limit_is_per_identity() {
    let state = test_state(|cfg| {
        cfg.rate_limit.auth.max_requests = 1;
        cfg.rate_limit.auth.window_secs = 60;
    });
    let app = test_app(&state, PipelineConfig::auth(), Arc::new(AtomicUsize::new(0)));

    let request = |ip: &'static str| {
        Request::builder()
            .uri("/api/workspaces/1/tasks")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(
        app.clone().oneshot(request("198.51.100.1")).await.unwrap().status(),
        StatusCode::OK
    );
    assert_eq!(
        app.clone().oneshot(request("198.51.100.1")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        app.oneshot(request("198.51.100.2")).await.unwrap().status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn cacheable_get_served_from_cache_on_repeat() {
    let state = test_state(|_| {});
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_app(&state, PipelineConfig::default(), hits.clone());

    let first = app.clone().oneshot(get_req("/api/workspaces/1/tasks")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "MISS");
    let first_body = body_json(first).await;

    let second = app.oneshot(get_req("/api/workspaces/1/tasks")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-cache"], "HIT");
    let second_body = body_json(second).await;

    assert_eq!(first_body, second_body);
    // The handler ran exactly once; the hit was served without next().
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_key_includes_query_string() {
    let state = test_state(|_| {});
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_app(&state, PipelineConfig::default(), hits.clone());

    app.clone()
        .oneshot(get_req("/api/workspaces/1/tasks?page=1"))
        .await
        .unwrap();
    let other = app
        .oneshot(get_req("/api/workspaces/1/tasks?page=2"))
        .await
        .unwrap();
    assert_eq!(other.headers()["x-cache"], "MISS");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn large_response_marked_compressed_when_gzip_accepted() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let req = Request::builder()
        .uri("/api/report")
        .header(header::ACCEPT_ENCODING, "gzip, deflate")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.headers()["content-encoding"], "gzip");
    assert_eq!(res.headers()["vary"], "Accept-Encoding");

    // No negotiation header, no compression marking.
    let res = app.oneshot(get_req("/api/report")).await.unwrap();
    assert!(res.headers().get(header::CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn small_response_not_marked_compressed() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    let req = Request::builder()
        .uri("/api/workspaces/1/tasks")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert!(res.headers().get(header::CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn request_timing_recorded_in_monitor() {
    let state = test_state(|_| {});
    let app = test_app(&state, PipelineConfig::default(), Arc::new(AtomicUsize::new(0)));

    app.oneshot(get_req("/api/workspaces/1/tasks")).await.unwrap();

    let summary = state.monitor.summary(None);
    let metric = summary
        .slowest_operations
        .iter()
        .find(|m| m.name == "GET /api/workspaces/1/tasks")
        .expect("request metric recorded");
    let meta = metric.metadata.as_ref().unwrap();
    assert_eq!(meta["status"], json!(200));
}
