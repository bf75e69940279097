//! Composable request-processing stages.
//!
//! Each stage has the onion contract `(request, next) -> response`: it runs
//! its pre-logic, optionally invokes the remainder of the chain, then runs its
//! post-logic on the way out. Stages are plain async functions; composition
//! and ordering live in [`crate::server::apply_pipeline`].

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use taskhive_core::monitoring::Metadata;

use crate::cache::CacheKey;
use crate::error::{ApiError, ErrorDetail};
use crate::rate_limit::PolicyKind;
use crate::server::AppState;

/// Responses at or above this size are marked for compression.
pub const COMPRESSION_MIN_BYTES: usize = 1024;
/// Recorded user-agent strings are truncated to this length.
const USER_AGENT_MAX_LEN: usize = 80;
/// Fixed Content-Security-Policy sent with every response.
pub const CONTENT_SECURITY_POLICY: &str =
    "default-src 'self'; frame-ancestors 'none'; base-uri 'self'";

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");
static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Inserted into request extensions by the authentication collaborator once a
/// session is validated. This layer only reads it.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

// =============================================================================
// Stage 1: Security headers
// =============================================================================

/// Set security response headers unconditionally, so even short-circuited and
/// error responses carry them.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    res
}

// =============================================================================
// Stage 2: Error boundary
// =============================================================================

/// Convert every error outcome into a structured JSON body, record it as a
/// zero-duration metric, and attach internal diagnostic detail only outside
/// production. No raw error ever reaches the caller from downstream stages.
pub async fn error_boundary(state: AppState, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let identity = caller_identity(&req);

    let res = next.run(req).await;
    let status = res.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return res;
    }

    let mut meta = Metadata::new();
    meta.insert("path".into(), json!(path));
    meta.insert("method".into(), json!(method));
    meta.insert("identity".into(), json!(identity));
    meta.insert("status".into(), json!(status.as_u16()));
    state.monitor.add_metric("request.error", 0.0, Some(meta));

    let expose_detail = !state.config.server.is_production();
    ensure_json_error(res, expose_detail).await
}

/// Rebuild an error response so the body is JSON with an `error` field,
/// merging in buffered detail when exposure is allowed.
async fn ensure_json_error(res: Response, expose_detail: bool) -> Response {
    let status = res.status();
    let detail = res.extensions().get::<ErrorDetail>().cloned();
    let is_json = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    // Already structured and nothing to merge: pass through untouched.
    if is_json && (detail.is_none() || !expose_detail) {
        return res;
    }

    let (mut parts, body) = res.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to read error response body");
            Bytes::new()
        }
    };

    let mut value: Value = if is_json {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| error_body(status, None))
    } else {
        let message = String::from_utf8_lossy(&bytes);
        let message = message.trim();
        error_body(status, (!message.is_empty()).then(|| message.to_string()))
    };
    if expose_detail {
        if let Some(ErrorDetail(detail)) = detail {
            value["detail"] = json!(detail);
        }
    }

    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Response::from_parts(parts, Body::from(body))
}

fn error_body(status: StatusCode, message: Option<String>) -> Value {
    let label = status.canonical_reason().unwrap_or("Error");
    match message {
        Some(message) => json!({ "error": label, "message": message }),
        None => json!({ "error": label }),
    }
}

// =============================================================================
// Stage 3: Logging / performance
// =============================================================================

/// Time the whole request, log its outcome, and record a metric tagged with
/// status, caller ip and truncated user-agent.
pub async fn request_logging(state: AppState, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let identity = caller_identity(&req);
    let ip = client_ip(&req).unwrap_or_else(|| "unknown".to_string());
    let user_agent: String = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .chars()
        .take(USER_AGENT_MAX_LEN)
        .collect();

    let started = std::time::Instant::now();
    let timing = state
        .monitor
        .start_timing(format!("{method} {path}"), None);

    let res = next.run(req).await;

    let status = res.status().as_u16();
    let mut meta = Metadata::new();
    meta.insert("status".into(), json!(status));
    meta.insert("ip".into(), json!(ip));
    meta.insert("userAgent".into(), json!(user_agent));
    let elapsed_ms = timing.stop_with(meta);

    crate::metrics::record_http_request(method.as_str(), &path, status, started.elapsed());
    tracing::info!(
        http.method = %method,
        http.path = %path,
        http.status = %status,
        elapsed_ms = format_args!("{elapsed_ms:.1}"),
        identity = %identity,
        "request handled"
    );
    res
}

// =============================================================================
// Stage 4: Rate limiting
// =============================================================================

/// Count the request against the caller's window and short-circuit with 429
/// when over quota. The `X-RateLimit-*` headers are set pass or fail.
pub async fn rate_limit(
    state: AppState,
    policy: PolicyKind,
    req: Request,
    next: Next,
) -> Response {
    let identity = caller_identity(&req);
    let limiter = state.limiters.select(policy);
    let decision = limiter.check(&identity).await;
    let limit = limiter.policy().max_requests;

    if !decision.allowed {
        let retry_after = decision.retry_after_secs();
        let body = json!({
            "error": "Too Many Requests",
            "message": format!("Rate limit exceeded, retry in {retry_after} seconds"),
            "retryAfter": retry_after,
        });
        let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        set_rate_limit_headers(&mut res, limit, decision.remaining, decision.reset_at_secs());
        return res;
    }

    let mut res = next.run(req).await;
    set_rate_limit_headers(&mut res, limit, decision.remaining, decision.reset_at_secs());
    res
}

fn set_rate_limit_headers(res: &mut Response, limit: u64, remaining: u64, reset_secs: u64) {
    let headers = res.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT.clone(), numeric_header(limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), numeric_header(remaining));
    headers.insert(X_RATELIMIT_RESET.clone(), numeric_header(reset_secs));
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

// =============================================================================
// Stage 5: Request validation
// =============================================================================

/// Reject mutating requests with an unexpected content type (400) or an
/// oversized body (413) before they reach a handler. The limit is enforced
/// on the bytes actually received, not just the declared length.
pub async fn validate_request(limit_bytes: usize, req: Request, next: Next) -> Response {
    let mutating = matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH);
    if !mutating {
        return next.run(req).await;
    }

    let content_type_ok = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !content_type_ok {
        return ApiError::Validation("Content-Type must be application/json".into())
            .into_response();
    }

    // Cheap early reject when the caller declares an oversized body.
    let declared_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared_len
        && len > limit_bytes
    {
        return ApiError::PayloadTooLarge { limit_bytes }.into_response();
    }

    // The declared length is advisory: chunked or mislabeled bodies must
    // still hit the limit when the bytes arrive.
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, limit_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::PayloadTooLarge { limit_bytes }.into_response(),
    };
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

// =============================================================================
// Stage 6: Compression negotiation
// =============================================================================

/// Mark large responses as compressed when the caller advertises gzip
/// support. The byte transformation itself is the transport collaborator's
/// concern; this layer serves bounded JSON bodies, so buffering to measure is
/// acceptable.
pub async fn compression(req: Request, next: Next) -> Response {
    let accepts_gzip = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    let res = next.run(req).await;
    if !accepts_gzip {
        return res;
    }

    let (mut parts, body) = res.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // Never serve a truncated body under the original status.
            tracing::error!(error = %e, "failed to read response body");
            return ApiError::Internal(anyhow::Error::new(e)).into_response();
        }
    };
    if bytes.len() >= COMPRESSION_MIN_BYTES {
        parts
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        parts
            .headers
            .insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    Response::from_parts(parts, Body::from(bytes))
}

// =============================================================================
// Stage 7: Response caching
// =============================================================================

/// Serve safe read requests from the cache.
///
/// On hit the chain is skipped entirely and the stored body is returned with
/// `X-Cache: HIT`; on miss, successful JSON responses are stored with the
/// route's TTL and marked `X-Cache: MISS`.
pub async fn response_cache(
    state: AppState,
    ttl: std::time::Duration,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET || !is_cacheable_path(req.uri().path()) {
        return next.run(req).await;
    }

    let identity = caller_identity(&req);
    let key = CacheKey::new("response")
        .segment(req.method())
        .segment(req.uri().path())
        .segment(&identity)
        .segment(req.uri().query().unwrap_or(""))
        .build();

    if let Some(cached) = state.cache.get(&key).await {
        let mut res = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            Bytes::from(cached.as_ref().clone()),
        )
            .into_response();
        res.headers_mut()
            .insert(X_CACHE.clone(), HeaderValue::from_static("HIT"));
        return res;
    }

    let res = next.run(req).await;
    let cacheable = res.status().is_success()
        && res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

    let (mut parts, body) = res.into_parts();
    parts
        .headers
        .insert(X_CACHE.clone(), HeaderValue::from_static("MISS"));
    if !cacheable {
        return Response::from_parts(parts, body);
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to read response body");
            return ApiError::Internal(anyhow::Error::new(e)).into_response();
        }
    };
    state.cache.set(&key, bytes.to_vec(), ttl).await;
    Response::from_parts(parts, Body::from(bytes))
}

/// Authentication routes and operational endpoints are never response-cached.
fn is_cacheable_path(path: &str) -> bool {
    !(path.starts_with("/auth")
        || matches!(path, "/" | "/healthz" | "/readyz" | "/metrics" | "/api/performance"))
}

// =============================================================================
// Caller identity
// =============================================================================

/// Resolve who is calling: the authenticated user id when the auth
/// collaborator has attached one, otherwise the network-level identifier.
pub fn caller_identity(req: &Request) -> String {
    if let Some(AuthenticatedUser(id)) = req.extensions().get::<AuthenticatedUser>() {
        return id.clone();
    }
    client_ip(req).unwrap_or_else(|| "anonymous".to_string())
}

/// First hop of X-Forwarded-For, if present.
fn client_ip(req: &Request) -> Option<String> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(builder: axum::http::request::Builder) -> Request {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_caller_identity_prefers_authenticated_user() {
        let mut req = request(
            axum::http::Request::builder()
                .uri("/api/tasks")
                .header("x-forwarded-for", "10.0.0.1"),
        );
        req.extensions_mut()
            .insert(AuthenticatedUser("user-7".into()));
        assert_eq!(caller_identity(&req), "user-7");
    }

    #[test]
    fn test_caller_identity_falls_back_to_forwarded_for() {
        let req = request(
            axum::http::Request::builder()
                .uri("/api/tasks")
                .header("x-forwarded-for", "10.0.0.1, 172.16.0.1"),
        );
        assert_eq!(caller_identity(&req), "10.0.0.1");
    }

    #[test]
    fn test_caller_identity_anonymous_without_hints() {
        let req = request(axum::http::Request::builder().uri("/api/tasks"));
        assert_eq!(caller_identity(&req), "anonymous");
    }

    #[test]
    fn test_cacheable_path_rules() {
        assert!(is_cacheable_path("/api/workspaces/1/tasks"));
        assert!(!is_cacheable_path("/auth/login"));
        assert!(!is_cacheable_path("/healthz"));
        assert!(!is_cacheable_path("/metrics"));
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(StatusCode::NOT_FOUND, Some("nope".into()));
        assert_eq!(body["error"], "Not Found");
        assert_eq!(body["message"], "nope");
        let bare = error_body(StatusCode::NOT_FOUND, None);
        assert!(bare.get("message").is_none());
    }
}
