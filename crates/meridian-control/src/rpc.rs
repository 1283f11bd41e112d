//! RPC dispatcher
//!
//! Unary calls over HTTP/2: the request body is one length-prefixed JSON
//! frame, the response is one frame followed by `grpc-status` trailers.
//! Failures are sent trailers-only, with the status in the response headers.

use crate::server::ControlState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use http_body_util::StreamBody;
use hyper::body::Frame;
use meridian_proto::rpc::{MESSAGE_HEADER, STATUS_HEADER};
use meridian_proto::{
    decode_frame, encode_frame, methods, Code, RpcStatus, AUTHORIZATION_METADATA, RPC_CONTENT_TYPE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

const KNOWN_METHODS: [&str; 11] = [
    methods::ISSUE_HUB_TOKEN,
    methods::GET_MANAGEMENT_TOKEN,
    methods::CREATE_TOKEN,
    methods::REVOKE_TOKEN,
    methods::FETCH_CONFIG,
    methods::HUB_REGISTER,
    methods::HUB_DISCONNECT,
    methods::REQUEST_SERVICE_TOKEN,
    methods::VERIFY_TOKEN,
    methods::ALL_HUBS,
    methods::CURRENT_FLOW_TOP,
];

pub fn rpc_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/{service}/{method}", post(handle_rpc))
        .fallback(unimplemented)
        .with_state(state)
}

async fn handle_rpc(
    State(state): State<Arc<ControlState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method = uri.path();
    let bearer = bearer_token(&headers);

    let result = dispatch(&state, method, bearer.as_deref(), &body).await;

    let code = result.as_ref().map(|_| Code::Ok).unwrap_or_else(|s| s.code);
    let label = if KNOWN_METHODS.contains(&method) {
        method
    } else {
        "unknown"
    };
    state.metrics.record_rpc(label, code);

    match result {
        Ok(payload) => ok_response(payload),
        Err(status) => {
            debug!(method, code = %status.code, message = %status.message, "RPC failed");
            status_response(&status)
        }
    }
}

async fn unimplemented() -> Response {
    status_response(&RpcStatus::new(Code::Unimplemented, "unknown method"))
}

async fn dispatch(
    state: &ControlState,
    method: &str,
    bearer: Option<&str>,
    body: &[u8],
) -> Result<Bytes, RpcStatus> {
    let svc = &state.service;
    match method {
        methods::ISSUE_HUB_TOKEN => reply(svc.issue_hub_token(bearer, decode(body)?).await),
        methods::GET_MANAGEMENT_TOKEN => {
            reply(svc.get_management_token(bearer, decode(body)?).await)
        }
        methods::CREATE_TOKEN => reply(svc.create_token(bearer, decode(body)?).await),
        methods::REVOKE_TOKEN => reply(svc.revoke_token(bearer, decode(body)?).await),
        methods::FETCH_CONFIG => reply(svc.fetch_config(bearer, decode(body)?).await),
        methods::HUB_REGISTER => reply(svc.hub_register(bearer, decode(body)?).await),
        methods::HUB_DISCONNECT => reply(svc.hub_disconnect(bearer, decode(body)?).await),
        methods::REQUEST_SERVICE_TOKEN => {
            reply(svc.request_service_token(bearer, decode(body)?).await)
        }
        methods::VERIFY_TOKEN => reply(svc.verify_token(bearer, decode(body)?).await),
        methods::ALL_HUBS => reply(svc.all_hubs(bearer, decode(body)?).await),
        methods::CURRENT_FLOW_TOP => reply(svc.current_flow_top(bearer, decode(body)?).await),
        other => Err(RpcStatus::new(
            Code::Unimplemented,
            format!("unknown method {}", other),
        )),
    }
}

/// Token from the `authorization` metadata, with or without a `Bearer ` prefix
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION_METADATA)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcStatus> {
    decode_frame(body).map_err(|e| RpcStatus::invalid_argument(format!("malformed request: {}", e)))
}

fn reply<T: Serialize>(result: crate::error::ControlResult<T>) -> Result<Bytes, RpcStatus> {
    let message = result.map_err(RpcStatus::from)?;
    encode_frame(&message).map_err(|e| RpcStatus::internal(e.to_string()))
}

fn status_headers(status: &RpcStatus) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        STATUS_HEADER,
        HeaderValue::from(u16::from(status.code.as_u8())),
    );
    if !status.message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&status.encoded_message()) {
            headers.insert(MESSAGE_HEADER, value);
        }
    }
    headers
}

fn ok_response(payload: Bytes) -> Response {
    let frames = futures::stream::iter([
        Ok::<_, Infallible>(Frame::data(payload)),
        Ok(Frame::trailers(status_headers(&RpcStatus::ok()))),
    ]);
    let mut response = Response::new(Body::new(StreamBody::new(frames)));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
    response
}

/// Trailers-only response carrying an error status
pub fn status_response(status: &RpcStatus) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
    headers.extend(status_headers(status));
    response
}
