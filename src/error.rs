//! Error kinds for gateway operations and JSON error responses for requests

use crate::gateway::GatewayState;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Response body type shared by every request path in the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Failures returned by registry, connector, certificate and orchestrator operations.
///
/// Every registration failure leaves prior state untouched.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing configuration, or a reference to something that does not exist
    #[error("validation failed: {0}")]
    Validation(String),

    /// Route or connector name collision
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown tenant, connector or certificate
    #[error("not found: {0}")]
    NotFound(String),

    /// Tenant server endpoints do not match the declared endpoint slots
    #[error("server endpoints do not match declared slots (missing: {missing:?}, undeclared: {undeclared:?})")]
    SlotMismatch {
        missing: Vec<String>,
        undeclared: Vec<String>,
    },

    /// Certificate subject name already registered by another certificate
    #[error("certificate subject name already registered: {0}")]
    DuplicateName(String),

    /// Orchestrator operation attempted outside its legal states
    #[error("{operation} requires state {required}, gateway is {current}")]
    InvalidState {
        operation: &'static str,
        required: String,
        current: GatewayState,
    },

    /// Listener bind, accept or TLS setup failure
    #[error("transport error on connector '{connector}': {source}")]
    Transport {
        connector: String,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation(message.into())
    }

    pub fn transport(connector: &str, source: std::io::Error) -> Self {
        GatewayError::Transport {
            connector: connector.to_string(),
            source,
        }
    }
}

/// Error codes for request-path failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No route matches connector, scheme, host, path and method
    NoRoute,
    /// Request could not be rewritten for the upstream
    BadGatewayRequest,
    /// Upstream connection or exchange failed
    UpstreamUnavailable,
    /// File or directory index not found under the root
    FileNotFound,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoRoute => StatusCode::NOT_FOUND,
            GatewayErrorCode::BadGatewayRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::FileNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoRoute => "NO_ROUTE",
            GatewayErrorCode::BadGatewayRequest => "BAD_GATEWAY_REQUEST",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::FileNotFound => "FILE_NOT_FOUND",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Wrap bytes into the boxed gateway body
pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}
