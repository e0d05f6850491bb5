use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

use crate::access::{Identity, StaticAccessControl};

pub const REALM: &str = "Basic realm=\"wflib\"";

#[derive(Clone)]
pub struct AuthState {
    pub accounts: Arc<StaticAccessControl>,
}

/// 401 with the Basic challenge git clients answer with credentials
pub fn challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, REALM)],
        "Unauthorized",
    )
        .into_response()
}

fn decode_basic(header_value: &str) -> Option<(String, String)> {
    let credentials = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(credentials.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Attach an [`Identity`] to the request.
///
/// No Authorization header means anonymous; whether that is enough is up to
/// the gateway. Credentials that are present but wrong are refused here.
pub async fn identify(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let identity = match request.headers().get(header::AUTHORIZATION) {
        None => Identity::Anonymous,
        Some(value) => {
            let authenticated = value
                .to_str()
                .ok()
                .and_then(decode_basic)
                .and_then(|(user, pass)| state.accounts.authenticate(&user, &pass));
            match authenticated {
                Some(identity) => identity,
                None => {
                    debug!("rejected invalid credentials");
                    return challenge();
                }
            }
        }
    };

    request.extensions_mut().insert(identity);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        // admin:s3:cret
        assert_eq!(
            decode_basic("Basic YWRtaW46czM6Y3JldA=="),
            Some(("admin".to_string(), "s3:cret".to_string()))
        );
        assert_eq!(decode_basic("Bearer abc"), None);
        assert_eq!(decode_basic("Basic !!!"), None);
        // no colon
        assert_eq!(decode_basic("Basic YWRtaW4="), None);
    }
}
