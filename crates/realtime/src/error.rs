use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

// ── Tracking errors ─────────────────────────────────────────────────

/// Failure taxonomy of the presence and module-usage trackers.
///
/// None of these reach a connected client: handlers log them and leave the
/// record as it was.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// Close/end event with nothing to close. Expected under reconnect races.
    #[error("no matching open session: {0}")]
    NotFoundRace(&'static str),
    /// Event payload failed validation.
    #[error("invalid event payload: {0}")]
    ValidationFailure(String),
    /// Stale version at save time.
    #[error("record version conflict")]
    ConcurrencyConflict,
    #[error("{operation} abandoned after {attempts} conflicting attempts")]
    RetriesExhausted { operation: &'static str, attempts: u32 },
    #[error("record store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl TrackingError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict)
    }
}

/// Handshake rejection reasons from the connection gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken,
}

// ── HTTP error envelope ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    InternalError,
    StoreUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::InternalError => "INTERNAL_ERROR",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError | Self::StoreUnavailable)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::InternalError => "internal server error",
            Self::StoreUnavailable => "usage record store is unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RealtimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
