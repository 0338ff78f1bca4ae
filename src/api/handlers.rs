//! Request handlers
//!
//! Each handler authenticates the caller, converts the JSON body into a
//! lifecycle request, runs it inside an `http_request` span and turns the
//! typed result into a response. Handlers never fail at the warp level.

use super::auth::{parse_basic_auth, AuthError};
use super::models::{
    ErrorResponse, FetchBody, HealthResponse, PublishBody, PublishResponse, ReadyResponse,
    RejectBody, SettleResponse,
};
use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::observability::metrics;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use warp::http::header::{HeaderValue, WWW_AUTHENTICATE};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const BASIC_CHALLENGE: &str = "Basic realm=\"amqp-bridge\"";

/// Failure raised while serving a request
#[derive(Debug)]
enum ApiError {
    Auth(AuthError),
    Bridge(BridgeError),
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        Self::Auth(error)
    }
}

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        Self::Bridge(error)
    }
}

impl ApiError {
    fn into_response(self, request_id: &str) -> Response {
        match self {
            ApiError::Auth(error) => {
                debug!(error = %error, "Rejected request without usable credentials");
                let body = ErrorResponse::new("unauthorized", error.to_string(), Some(request_id.to_string()));
                with_challenge(json_response(StatusCode::UNAUTHORIZED, &body, request_id))
            }
            ApiError::Bridge(error) => error_response(&error, request_id),
        }
    }
}

/// JSON body with status and the request id echoed back
pub fn json_response<T: Serialize>(status: StatusCode, body: &T, request_id: &str) -> Response {
    let reply = warp::reply::with_status(warp::reply::json(body), status);
    with_request_id(reply.into_response(), request_id)
}

pub fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn with_challenge(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_CHALLENGE));
    response
}

/// Map a bridge error onto its HTTP status and a sanitized body
pub fn error_response(error: &BridgeError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        warn!(code = error.error_code(), error = %error, status = status.as_u16(), "Request failed");
    } else {
        debug!(code = error.error_code(), error = %error, status = status.as_u16(), "Request rejected");
    }

    let response = json_response(
        status,
        &ErrorResponse::from_bridge_error(error, request_id),
        request_id,
    );
    if status == StatusCode::UNAUTHORIZED {
        with_challenge(response)
    } else {
        response
    }
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, BridgeError> {
    if body.is_empty() {
        return Err(BridgeError::invalid_input("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|e| BridgeError::invalid_input(format!("invalid request body: {e}")))
}

fn finish(result: Result<Response, ApiError>, request_id: &str) -> Result<Response, Infallible> {
    Ok(result.unwrap_or_else(|error| error.into_response(request_id)))
}

pub async fn publish(
    bridge: Arc<Bridge>,
    request_id: String,
    authorization: Option<String>,
    body: Bytes,
) -> Result<Response, Infallible> {
    let span = crate::http_span!(request_id = %request_id, route = "publish");
    let result = publish_message(&bridge, &request_id, authorization.as_deref(), &body)
        .instrument(span)
        .await;
    finish(result, &request_id)
}

async fn publish_message(
    bridge: &Bridge,
    request_id: &str,
    authorization: Option<&str>,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let credential = parse_basic_auth(authorization)?;
    let request = parse_json::<PublishBody>(body)?.into_request(request_id)?;

    let receipt = bridge.coordinator().publish(&credential, request).await?;
    info!(
        exchange = %receipt.exchange,
        routing_key = %receipt.routing_key,
        message_id = %receipt.message_id,
        "Message published"
    );

    let response = PublishResponse {
        status: "accepted".to_string(),
        request_id: request_id.to_string(),
        exchange: receipt.exchange,
        routing_key: receipt.routing_key,
        message_id: receipt.message_id,
        correlation_id: receipt.correlation_id,
    };
    Ok(json_response(StatusCode::ACCEPTED, &response, request_id))
}

pub async fn fetch(
    bridge: Arc<Bridge>,
    request_id: String,
    authorization: Option<String>,
    body: Bytes,
) -> Result<Response, Infallible> {
    let span = crate::http_span!(request_id = %request_id, route = "fetch");
    let result = fetch_message(&bridge, &request_id, authorization.as_deref(), &body)
        .instrument(span)
        .await;
    finish(result, &request_id)
}

async fn fetch_message(
    bridge: &Bridge,
    request_id: &str,
    authorization: Option<&str>,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let credential = parse_basic_auth(authorization)?;
    let request = parse_json::<FetchBody>(body)?.into_request()?;

    match bridge.coordinator().fetch_one(&credential, request).await? {
        Some(message) => {
            debug!(delivery_tag = message.delivery_tag, "Message fetched");
            Ok(json_response(StatusCode::OK, &message, request_id))
        }
        None => Ok(with_request_id(
            StatusCode::NO_CONTENT.into_response(),
            request_id,
        )),
    }
}

pub async fn ack(
    delivery_tag: u64,
    bridge: Arc<Bridge>,
    request_id: String,
    authorization: Option<String>,
) -> Result<Response, Infallible> {
    let span = crate::http_span!(request_id = %request_id, route = "ack", delivery_tag = delivery_tag);
    let result = async {
        let credential = parse_basic_auth(authorization.as_deref())?;
        bridge.coordinator().ack(&credential, delivery_tag).await?;
        Ok::<_, ApiError>(json_response(
            StatusCode::OK,
            &SettleResponse::acknowledged(delivery_tag),
            &request_id,
        ))
    }
    .instrument(span)
    .await;

    finish(result, &request_id)
}

pub async fn reject(
    delivery_tag: u64,
    bridge: Arc<Bridge>,
    request_id: String,
    authorization: Option<String>,
    body: Bytes,
) -> Result<Response, Infallible> {
    let span = crate::http_span!(request_id = %request_id, route = "reject", delivery_tag = delivery_tag);
    let result = reject_message(&bridge, &request_id, authorization.as_deref(), delivery_tag, &body)
        .instrument(span)
        .await;
    finish(result, &request_id)
}

async fn reject_message(
    bridge: &Bridge,
    request_id: &str,
    authorization: Option<&str>,
    delivery_tag: u64,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let credential = parse_basic_auth(authorization)?;
    let options = if body.is_empty() {
        RejectBody::default()
    } else {
        parse_json::<RejectBody>(body)?
    };

    bridge
        .coordinator()
        .reject(&credential, delivery_tag, options.requeue)
        .await?;
    Ok(json_response(
        StatusCode::OK,
        &SettleResponse::rejected(delivery_tag, options.requeue),
        request_id,
    ))
}

pub async fn health(request_id: String) -> Result<Response, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &HealthResponse::healthy(),
        &request_id,
    ))
}

pub async fn ready(bridge: Arc<Bridge>, request_id: String) -> Result<Response, Infallible> {
    let readiness = bridge.coordinator().readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(json_response(
        status,
        &ReadyResponse::from(readiness),
        &request_id,
    ))
}

pub async fn metrics_snapshot(request_id: String) -> Result<Response, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &metrics().get_metrics(),
        &request_id,
    ))
}
