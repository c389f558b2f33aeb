// Credential checks shared by the realtime channel and the reporting API.
//
// The handshake credential arrives as the `token` query parameter (the
// client library's `auth.token`) or, for non-browser clients, as an
// `Authorization: Bearer` header. Reporting requests only use the header.
// A rejected handshake never produces a connection context.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use tracing::warn;

use super::jwt::{Identity, JwtAccessTokenService};
use crate::error::GateError;

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

pub fn authenticate_handshake(
    jwt_service: &JwtAccessTokenService,
    query: &HandshakeQuery,
    headers: &HeaderMap,
) -> Result<Identity, GateError> {
    let token = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(headers))
        .ok_or(GateError::MissingToken)?;

    verify(jwt_service, token, "realtime handshake")
}

pub fn authenticate_bearer(
    jwt_service: &JwtAccessTokenService,
    headers: &HeaderMap,
) -> Result<Identity, GateError> {
    let token = bearer_token(headers).ok_or(GateError::MissingToken)?;
    verify(jwt_service, token, "bearer request")
}

fn verify(
    jwt_service: &JwtAccessTokenService,
    token: &str,
    surface: &'static str,
) -> Result<Identity, GateError> {
    jwt_service.validate_token(token).map_err(|error| {
        warn!(surface, error = %error, "rejecting access token");
        GateError::InvalidToken
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    Some(token.trim()).filter(|token| !token.is_empty())
}
