//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No exhibit with the requested id
    UnknownExhibit,
    /// On-demand start failed (livecheck or provisioning error)
    BackendStartFailed,
    /// Timed out waiting for the backend to become running
    BackendStartTimeout,
    /// Container runtime or state store query failed
    InfrastructureError,
    /// Failed to connect to a resolved backend
    ConnectionFailed,
    /// Request timed out against the backend
    RequestTimeout,
    /// Body rewriting failed (unsupported or corrupt content encoding)
    RewriteFailed,
    /// Malformed request
    InvalidRequest,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownExhibit => StatusCode::NOT_FOUND,
            GatewayErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::BackendStartTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::InfrastructureError => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::RewriteFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownExhibit => "UNKNOWN_EXHIBIT",
            GatewayErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            GatewayErrorCode::BackendStartTimeout => "BACKEND_START_TIMEOUT",
            GatewayErrorCode::InfrastructureError => "INFRASTRUCTURE_ERROR",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::RewriteFailed => "REWRITE_FAILED",
            GatewayErrorCode::InvalidRequest => "INVALID_REQUEST",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
