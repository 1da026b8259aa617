use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::auth::gate::require_auth;
use crate::AppState;

pub mod handlers;

/// Request bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Routes under `/api`. Everything except register and login goes through the
/// bearer gate.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let public = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login));

    let protected = Router::new()
        .route("/logout", post(handlers::logout))
        .route("/delete", post(handlers::delete_user))
        .route("/change_password", post(handlers::change_password))
        .route("/update", post(handlers::update_user))
        .route("/users", get(handlers::get_user))
        .route("/users/list", get(handlers::list_users))
        .route("/tokens", get(handlers::list_tokens))
        .route("/tokens/purge_expired", post(handlers::purge_expired_tokens))
        .route_layer(middleware::from_fn_with_state(state, require_auth));

    public.merge(protected).fallback(fallback_404)
}

/// The complete service: API, probes, metrics and the cross-cutting layers.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_router(state.clone()))
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    if let Some(origin) = state.config.cors_origin.as_deref() {
        router = router.layer(cors_layer(origin));
    }

    router
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

fn cors_layer(origin: &str) -> CorsLayer {
    let allowed = origin.to_string();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin.to_str().map(|o| o == allowed).unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Ready when the store answers a round trip.
async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    match state.issuer.store().ping().await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

/// Middleware: echoes the caller's X-Request-Id, or mints one, on every response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %req_id);
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers on every response. Token-bearing responses
/// must never be cached.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove(header::SERVER);

    resp
}
