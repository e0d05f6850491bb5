//! Git smart HTTP routes
//!
//!   - GET  /<url_name>/info/refs?service=git-upload-pack|git-receive-pack
//!   - POST /<url_name>/git-upload-pack
//!   - POST /<url_name>/git-receive-pack
//!
//! Repository work is blocking filesystem I/O, so every request runs on the
//! blocking pool.

use axum::{
    body::Bytes,
    extract::{Extension, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, warn};
use wflib_git::http::{decode_request_body, Service};

use super::auth::challenge;
use crate::access::Identity;
use crate::gateway::{GatewayError, PushGateway};

#[derive(Clone)]
pub struct GitState {
    pub gateway: Arc<PushGateway>,
}

#[derive(serde::Deserialize)]
pub struct InfoRefsQuery {
    service: String,
}

fn error_response(err: GatewayError) -> Response {
    match err {
        GatewayError::Authorization { identity } if identity.is_anonymous() => challenge(),
        GatewayError::Authorization { identity } => (
            StatusCode::FORBIDDEN,
            format!("{} may not push to this repository", identity),
        )
            .into_response(),
        GatewayError::NotInitialized(_) => {
            (StatusCode::NOT_FOUND, "Repository not found").into_response()
        }
        GatewayError::Git(wflib_git::Error::ProtocolError(msg)) => {
            warn!(%msg, "bad git request");
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        err => {
            error!(error = %err, "git request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn git_response(
    result: Result<Result<Vec<u8>, GatewayError>, JoinError>,
    content_type: &'static str,
) -> Response {
    match result {
        Ok(Ok(body)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response(),
        Ok(Err(err)) => error_response(err),
        Err(join) => {
            error!(error = %join, "git request task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// GET /<url_name>/info/refs
pub async fn info_refs(
    State(state): State<GitState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<InfoRefsQuery>,
) -> Response {
    let Ok(service) = query.service.parse::<Service>() else {
        return (StatusCode::BAD_REQUEST, "Unknown service").into_response();
    };

    let gateway = state.gateway.clone();
    let result =
        tokio::task::spawn_blocking(move || gateway.advertise(service, &identity)).await;
    git_response(result, service.advertisement_content_type())
}

/// POST /<url_name>/git-upload-pack (fetch)
pub async fn upload_pack(State(state): State<GitState>, headers: HeaderMap, body: Bytes) -> Response {
    let gateway = state.gateway.clone();
    let encoding = content_encoding(&headers);
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, GatewayError> {
        let body = decode_request_body(encoding.as_deref(), &body)?;
        gateway.upload(&body)
    })
    .await;
    git_response(result, Service::UploadPack.result_content_type())
}

/// POST /<url_name>/git-receive-pack (push)
pub async fn receive_pack(
    State(state): State<GitState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let gateway = state.gateway.clone();
    let encoding = content_encoding(&headers);
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, GatewayError> {
        let body = decode_request_body(encoding.as_deref(), &body)?;
        gateway.receive(&identity, &body)
    })
    .await;
    git_response(result, Service::ReceivePack.result_content_type())
}
