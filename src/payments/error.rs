use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Generic fallback used by every driver's status-code table.
pub const UNKNOWN_ERROR_MESSAGE: &str = "خطای ناشناخته رخ داده است.";

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Driver not found: driver={driver}, reason={reason}")]
    DriverNotFound { driver: String, reason: String },

    #[error("Invoice not found: {reason}")]
    InvoiceNotFound { reason: String },

    #[error("Purchase failed: driver={driver}, message={message}")]
    PurchaseFailed {
        driver: String,
        message: String,
        code: Option<String>,
    },

    #[error("Invalid payment: driver={driver}, message={message}")]
    InvalidPayment {
        driver: String,
        message: String,
        code: Option<String>,
    },

    #[error("Gateway timeout: driver={driver}, message={message}")]
    Timeout { driver: String, message: String },

    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Listener for {event} event failed: {message}")]
    ListenerFailed { event: String, message: String },
}

impl PaymentError {
    pub fn driver_not_found(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        PaymentError::DriverNotFound {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    pub fn purchase_failed(
        driver: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        PaymentError::PurchaseFailed {
            driver: driver.into(),
            message: message.into(),
            code,
        }
    }

    pub fn invalid_payment(
        driver: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        PaymentError::InvalidPayment {
            driver: driver.into(),
            message: message.into(),
            code,
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        PaymentError::ValidationError {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Gateway-specific status code, when the gateway supplied one.
    pub fn gateway_code(&self) -> Option<&str> {
        match self {
            PaymentError::PurchaseFailed { code, .. } | PaymentError::InvalidPayment { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::DriverNotFound { .. } => 404,
            PaymentError::InvoiceNotFound { .. } => 404,
            PaymentError::PurchaseFailed { .. } => 502,
            PaymentError::InvalidPayment { .. } => 402,
            PaymentError::Timeout { .. } => 504,
            PaymentError::ValidationError { .. } => 400,
            PaymentError::ListenerFailed { .. } => 500,
        }
    }

    /// Text intended for the payer. Gateway errors carry the localized
    /// message from the driver's status table unchanged.
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::DriverNotFound { driver, .. } => {
                format!("Payment driver '{}' is not available", driver)
            }
            PaymentError::InvoiceNotFound { .. } => "Invoice not found".to_string(),
            PaymentError::PurchaseFailed { message, .. } => message.clone(),
            PaymentError::InvalidPayment { message, .. } => message.clone(),
            PaymentError::Timeout { .. } => {
                "Payment gateway did not respond in time. Please retry shortly".to_string()
            }
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::ListenerFailed { .. } => "An internal error occurred".to_string(),
        }
    }
}
