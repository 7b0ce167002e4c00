use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const TEXT_PLAIN_UTF_8: &str = "text/plain; charset=utf-8";

/// Caller-visible failure classes. Each maps to one status and one fixed body;
/// nothing else about a failure is ever returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    BadRequest,
    UpstreamFailure,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::UpstreamFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::BadRequest => "Bad request",
            Self::UpstreamFailure => "Internal server error",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad_request",
            Self::UpstreamFailure => "upstream_failure",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, code, message)
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, code, message)
    }

    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFailure, code, message)
    }
}

/// Plain-text response carrying only the fixed body for `kind`.
pub fn plain_error_response(kind: ErrorKind) -> Response {
    let mut resp = (kind.status(), kind.body()).into_response();
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(TEXT_PLAIN_UTF_8),
    );
    resp
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.kind {
            ErrorKind::UpstreamFailure => {
                tracing::error!(code = %self.code, message = %self.message, "request failed")
            }
            _ => tracing::warn!(code = %self.code, message = %self.message, "request rejected"),
        }
        plain_error_response(self.kind)
    }
}

pub type AppResult<T> = Result<T, AppError>;
