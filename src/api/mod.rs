//! HTTP API
//!
//! warp routes that translate requests into lifecycle operations:
//!
//! - `POST /v1/publish` - publish with confirm, 202 on success
//! - `POST /v1/fetch` - take one message, 200 or 204 when the queue stays empty
//! - `POST /v1/ack/{tag}` and `POST /v1/reject/{tag}` - settle a fetched message
//! - `GET /health`, `GET /ready`, `GET /metrics`
//!
//! Callers authenticate with HTTP Basic; those credentials are the broker
//! credentials. The `/v1` routes are rate limited per peer address when
//! `[rate_limit]` is enabled. Every response carries `X-Request-ID` and
//! security headers.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod validation;

use crate::bridge::Bridge;
use bytes::Bytes;
use models::ErrorResponse;
use rate_limit::{rate_limit, retry_after_secs, RateLimited};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use warp::http::header::{self, HeaderMap, HeaderValue};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

pub use handlers::REQUEST_ID_HEADER;

pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Request body larger than the configured limit
#[derive(Debug)]
pub struct BodyTooLarge {
    pub limit: u64,
}

impl warp::reject::Reject for BodyTooLarge {}

/// Build the complete route tree for a running bridge
pub fn routes(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let body_limit = bridge.config().server.max_request_body_bytes;
    let limiter = bridge.rate_limiter().clone();

    let publish = warp::path!("v1" / "publish")
        .and(warp::post())
        .and(rate_limit(limiter.clone()))
        .and(with_bridge(bridge.clone()))
        .and(request_id())
        .and(authorization())
        .and(limited_body(body_limit))
        .and_then(handlers::publish);

    let fetch = warp::path!("v1" / "fetch")
        .and(warp::post())
        .and(rate_limit(limiter.clone()))
        .and(with_bridge(bridge.clone()))
        .and(request_id())
        .and(authorization())
        .and(limited_body(body_limit))
        .and_then(handlers::fetch);

    let ack = warp::path!("v1" / "ack" / u64)
        .and(warp::post())
        .and(rate_limit(limiter.clone()))
        .and(with_bridge(bridge.clone()))
        .and(request_id())
        .and(authorization())
        .and_then(handlers::ack);

    let reject = warp::path!("v1" / "reject" / u64)
        .and(warp::post())
        .and(rate_limit(limiter))
        .and(with_bridge(bridge.clone()))
        .and(request_id())
        .and(authorization())
        .and(limited_body(body_limit))
        .and_then(handlers::reject);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(request_id())
        .and_then(handlers::health);

    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_bridge(bridge))
        .and(request_id())
        .and_then(handlers::ready);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(request_id())
        .and_then(handlers::metrics_snapshot);

    publish
        .or(fetch)
        .or(ack)
        .or(reject)
        .or(health)
        .or(ready)
        .or(metrics)
        .recover(handle_rejection)
        .with(warp::reply::with::headers(security_headers()))
}

/// Bind and serve until `shutdown_signal` resolves
pub async fn serve<S>(
    bridge: Arc<Bridge>,
    addr: SocketAddr,
    shutdown_signal: S,
) -> Result<(), warp::Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(routes(bridge)).try_bind_with_graceful_shutdown(addr, shutdown_signal)?;
    info!(address = %bound, "HTTP server listening");
    server.await;
    info!("HTTP server stopped");
    Ok(())
}

fn with_bridge(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (Arc<Bridge>,), Error = Infallible> + Clone {
    warp::any().map(move || bridge.clone())
}

/// Incoming `X-Request-ID` when it is a plain token, otherwise a new UUID
fn request_id() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::header::optional::<String>(REQUEST_ID_HEADER)
        .or(warp::any().map(|| None))
        .unify()
        .map(|incoming: Option<String>| {
            incoming
                .filter(|id| validation::is_valid_request_id(id))
                .unwrap_or_else(|| Uuid::new_v4().to_string())
        })
}

fn authorization() -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::header::optional::<String>("authorization")
        .or(warp::any().map(|| None))
        .unify()
}

/// Request body, refused before reading when `Content-Length` is over the limit
fn limited_body(limit: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and_then(move |length: Option<u64>| async move {
            match length {
                Some(length) if length > limit => Err(warp::reject::custom(BodyTooLarge { limit })),
                _ => Ok(()),
            }
        })
        .untuple_one()
        .and(warp::body::bytes())
        .and_then(move |body: Bytes| async move {
            if body.len() as u64 > limit {
                Err(warp::reject::custom(BodyTooLarge { limit }))
            } else {
                Ok(body)
            }
        })
}

fn security_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let request_id = Uuid::new_v4().to_string();

    if let Some(limited) = err.find::<RateLimited>() {
        let retry_after = retry_after_secs(limited.retry_after);
        let mut response = handlers::json_response(
            StatusCode::TOO_MANY_REQUESTS,
            &ErrorResponse::new(
                "rate_limit_exceeded",
                format!("rate limit exceeded, retry in {retry_after} seconds"),
                Some(request_id.clone()),
            ),
            &request_id,
        );
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("0"));
        return Ok(response);
    }

    let (status, code, detail) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "no such route".to_string())
    } else if let Some(too_large) = err.find::<BodyTooLarge>() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "request_too_large",
            format!("request body exceeds {} bytes", too_large.limit),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed".to_string(),
        )
    } else if let Some(invalid) = err.find::<warp::reject::InvalidHeader>() {
        (
            StatusCode::BAD_REQUEST,
            "invalid_header",
            format!("invalid header: {}", invalid.name()),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "unhandled request".to_string(),
        )
    };

    debug!(status = status.as_u16(), code = code, "Request rejected by router");
    Ok(handlers::json_response(
        status,
        &ErrorResponse::new(code, detail, Some(request_id.clone())),
        &request_id,
    ))
}
