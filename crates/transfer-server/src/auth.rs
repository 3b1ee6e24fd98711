use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use constant_time_eq::constant_time_eq;
use tracing::debug;

use crate::AppState;

pub const REALM: &str = "Transfer";

/// Credentials from an `Authorization: Basic ...` header.
#[derive(Debug, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

pub fn parse_basic(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Any non-empty user name is accepted; only the password is checked.
pub fn credentials_match(creds: &BasicCredentials, expected: &str) -> bool {
    !creds.username.is_empty() && constant_time_eq(creds.password.as_bytes(), expected.as_bytes())
}

/// Axum middleware enforcing HTTP Basic auth when a password is configured.
pub async fn require_password(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let settings = state.settings.current();
    let Some(expected) = settings.password() else {
        return next.run(request).await;
    };

    match parse_basic(request.headers()) {
        Some(creds) if credentials_match(&creds, expected) => next.run(request).await,
        other => {
            debug!(
                path = %request.uri().path(),
                supplied = other.is_some(),
                "rejecting request without valid credentials"
            );
            (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    format!("Basic realm=\"{REALM}\", charset=\"UTF-8\""),
                )],
                "Unauthorized",
            )
                .into_response()
        }
    }
}
