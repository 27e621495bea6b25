//! Generic JSON error responses produced by the gateway itself
//!
//! Responses coming from the container are never rewritten; these are only
//! used when no route matches or a route handler fails.

use crate::platform::GatewayBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway-generated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No route for this method and path
    NotFound,
    /// A route handler failed
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
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

/// Create a JSON error response with an X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// The default response for unmatched routes
pub fn not_found() -> Response<GatewayBody> {
    json_error_response(GatewayErrorCode::NotFound, "Not Found")
}

/// The generic response for a failed route handler. Never carries error details.
pub fn internal_error() -> Response<GatewayBody> {
    json_error_response(GatewayErrorCode::InternalError, "Internal Server Error")
}
