use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::store::EventStoreError;
use crate::models::{
    cascade::CascadeError, fraud_advice::FraudAdviceError, values::ValueError,
    IllegalStateTransition, PurchaseProcessError, SessionId,
};
use crate::services::{biller::BillerGatewayError, payment_template::PaymentTemplateError};

/// Error body handed to callers of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Conflict", "Bad Gateway")
    pub error: String,
    pub message: String,
    pub status: u16,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

impl From<&ServiceError> for ErrorResponse {
    fn from(err: &ServiceError) -> Self {
        let status = err.status_code();
        Self {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: err.response_message(),
            status: status.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Illegal state transition: {0}")]
    IllegalTransition(#[from] IllegalStateTransition),

    #[error("No more billers available in the cascade")]
    CascadeExhausted,

    #[error("Cascade error: {0}")]
    Cascade(CascadeError),

    #[error("Captcha error: {0}")]
    FraudAdvice(#[from] FraudAdviceError),

    #[error("Payment template error: {0}")]
    PaymentTemplate(PaymentTemplateError),

    #[error("Biller error: {0}")]
    Biller(#[from] BillerGatewayError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Purchase session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Circuit breaker open for {0}")]
    CircuitBreakerOpen(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<CascadeError> for ServiceError {
    fn from(err: CascadeError) -> Self {
        match err {
            CascadeError::InvalidNextBiller => ServiceError::CascadeExhausted,
            other => ServiceError::Cascade(other),
        }
    }
}

impl From<PaymentTemplateError> for ServiceError {
    fn from(err: PaymentTemplateError) -> Self {
        match err {
            PaymentTemplateError::CircuitOpen { command } => {
                ServiceError::CircuitBreakerOpen(command)
            }
            other => ServiceError::PaymentTemplate(other),
        }
    }
}

impl From<PurchaseProcessError> for ServiceError {
    fn from(err: PurchaseProcessError) -> Self {
        match err {
            PurchaseProcessError::IllegalTransition(e) => e.into(),
            PurchaseProcessError::Cascade(e) => e.into(),
            PurchaseProcessError::FraudAdvice(e) => e.into(),
            PurchaseProcessError::UnknownItem(id) => {
                ServiceError::ValidationError(format!("item {} is not part of this purchase", id))
            }
            other => ServiceError::InternalError(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<ValueError> for ServiceError {
    fn from(err: ValueError) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<config::ConfigError> for ServiceError {
    fn from(err: config::ConfigError) -> Self {
        ServiceError::ConfigError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::IllegalTransition(_) => StatusCode::CONFLICT,
            Self::CascadeExhausted => StatusCode::PAYMENT_REQUIRED,
            Self::Cascade(_) | Self::FraudAdvice(_) | Self::ValidationError(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PaymentTemplate(PaymentTemplateError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::PaymentTemplate(e) if e.is_caller_error() => StatusCode::BAD_REQUEST,
            Self::PaymentTemplate(_) | Self::Biller(_) => StatusCode::BAD_GATEWAY,
            Self::EventStore(EventStoreError::VersionConflict { .. }) => StatusCode::CONFLICT,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::CircuitBreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::EventStore(_) | Self::ConfigError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a user-safe error message.
    /// Internal details are hidden for server errors.
    pub fn response_message(&self) -> String {
        match self {
            // For internal errors, return generic messages to avoid leaking details
            Self::EventStore(EventStoreError::VersionConflict { session_id, .. }) => {
                format!("Concurrent modification of purchase session {}", session_id)
            }
            Self::EventStore(_) | Self::ConfigError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::PaymentTemplate(e) if !e.is_caller_error() => {
                "Payment template service unavailable".to_string()
            }
            Self::Biller(_) => "Biller unavailable".to_string(),
            Self::CircuitBreakerOpen(_) => "Service temporarily unavailable".to_string(),
            // For user-facing errors, return the actual message
            _ => self.to_string(),
        }
    }
}
