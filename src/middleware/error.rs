//! Error response formatting
//!
//! Every failure on the HTTP surface is rendered as the same JSON envelope,
//! with the status taken from [`PaymentError::http_status_code`].

use crate::payments::error::PaymentError;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error kind
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Gateway status code, when the gateway reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// ISO 8601 timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn from_payment_error(error: &PaymentError, request_id: Option<String>) -> Self {
        Self {
            error: error_kind(error).to_string(),
            message: error.user_message(),
            code: error.gateway_code().map(str::to_string),
            request_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Create a bad request response for malformed input
    pub fn bad_request(message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: "VALIDATION_ERROR".to_string(),
            message: message.into(),
            code: None,
            request_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

fn error_kind(error: &PaymentError) -> &'static str {
    match error {
        PaymentError::DriverNotFound { .. } => "DRIVER_NOT_FOUND",
        PaymentError::InvoiceNotFound { .. } => "INVOICE_NOT_FOUND",
        PaymentError::PurchaseFailed { .. } => "PURCHASE_FAILED",
        PaymentError::InvalidPayment { .. } => "INVALID_PAYMENT",
        PaymentError::Timeout { .. } => "GATEWAY_TIMEOUT",
        PaymentError::ValidationError { .. } => "VALIDATION_ERROR",
        PaymentError::ListenerFailed { .. } => "INTERNAL_ERROR",
    }
}

/// [`PaymentError`] with the request id of the request that produced it.
#[derive(Debug)]
pub struct ApiError {
    pub error: PaymentError,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(error: PaymentError, headers: &HeaderMap) -> Self {
        Self {
            error,
            request_id: get_request_id_from_headers(headers),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = StatusCode::from_u16(self.error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self.error,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self.error,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_payment_error(&self.error, self.request_id);
        (status_code, Json(error_response)).into_response()
    }
}

/// Helper to extract request ID from request headers
pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Build a standardized JSON error response for handlers that reject input
/// before any payment logic runs.
pub fn json_error_response(
    status: StatusCode,
    message: impl Into<String>,
    request_id: Option<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse::bad_request(message, request_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_error_response_carries_gateway_code() {
        let error = PaymentError::invalid_payment("zarinpal", "تراکنش ناموفق", Some("-51".into()));
        let response = ErrorResponse::from_payment_error(&error, Some("req_123".to_string()));

        assert_eq!(response.error, "INVALID_PAYMENT");
        assert_eq!(response.code.as_deref(), Some("-51"));
        assert_eq!(response.message, "تراکنش ناموفق");
        assert_eq!(response.request_id.as_deref(), Some("req_123"));
    }

    #[test]
    fn test_code_is_omitted_when_absent() {
        let error = PaymentError::validation("amount must be numeric", Some("amount"));
        let value = serde_json::to_value(ErrorResponse::from_payment_error(&error, None)).unwrap();

        assert!(value.get("code").is_none());
        assert_eq!(value["error"], "VALIDATION_ERROR");
    }

    #[test]
    fn test_api_error_into_response_uses_payment_status() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req_456"));

        let not_found = ApiError::new(PaymentError::driver_not_found("paypal", "unknown"), &headers);
        assert_eq!(not_found.request_id.as_deref(), Some("req_456"));
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let timeout = ApiError::new(
            PaymentError::Timeout {
                driver: "zibal".to_string(),
                message: "deadline exceeded".to_string(),
            },
            &HeaderMap::new(),
        );
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
