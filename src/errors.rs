use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::booking::BookingStatus;

/// Main error type for the booking service
#[derive(Debug, Error)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {} errors", .0.len())]
    ValidationFailed(Vec<ValidationError>),
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    // Lookup errors
    #[error("Booking not found: {0}")]
    BookingNotFound(String),
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
    #[error("Not found: {0}")]
    NotFound(String),

    // Lifecycle guard errors
    #[error("Cannot {action} a booking that is {from}")]
    InvalidTransition { from: BookingStatus, action: &'static str },
    #[error("Complete your active booking first")]
    DriverBusy,
    #[error("Driver is not allowed to take bookings: {0}")]
    DriverNotEligible(String),
    #[error("Invalid OTP")]
    OtpMismatch,
    #[error("No completion OTP has been generated for this booking")]
    OtpNotGenerated,
    #[error("Completion OTP has expired, generate a new one")]
    OtpExpired,
    #[error("Conflict: {0}")]
    Conflict(String),

    // Storage and upstream errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("Push delivery failed: {0}")]
    PushDelivery(String),
    #[error("Directions lookup failed: {0}")]
    Directions(String),

    // Configuration and setup errors
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationFailed(_)
            | AppError::MissingRequiredField(_)
            | AppError::InvalidTransition { .. }
            | AppError::DriverNotEligible(_)
            | AppError::OtpMismatch
            | AppError::OtpNotGenerated
            | AppError::OtpExpired => StatusCode::BAD_REQUEST,

            AppError::BookingNotFound(_) | AppError::DriverNotFound(_) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }

            AppError::DriverBusy | AppError::Conflict(_) => StatusCode::CONFLICT,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::ValidationFailed(_) => "validation_failed",
            AppError::MissingRequiredField(_) => "missing_field",
            AppError::BookingNotFound(_) => "booking_not_found",
            AppError::DriverNotFound(_) => "driver_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::DriverBusy => "driver_busy",
            AppError::DriverNotEligible(_) => "driver_not_eligible",
            AppError::OtpMismatch => "otp_mismatch",
            AppError::OtpNotGenerated => "otp_not_generated",
            AppError::OtpExpired => "otp_expired",
            AppError::Conflict(_) => "conflict",
            _ => "internal_error",
        }
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        AppError::MissingRequiredField(field.into())
    }

    pub fn booking_not_found(booking_id: impl Into<String>) -> Self {
        AppError::BookingNotFound(booking_id.into())
    }

    pub fn driver_not_found(driver_id: impl Into<String>) -> Self {
        AppError::DriverNotFound(driver_id.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (message, details) = match &self {
            AppError::ValidationFailed(errors) => (
                errors
                    .first()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .unwrap_or_else(|| "Validation errors occurred".to_string()),
                serde_json::to_value(errors).ok(),
            ),
            // Internal detail stays in the logs
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "Request failed with internal error");
                ("Internal server error".to_string(), None)
            }
            _ => (self.to_string(), None),
        };

        let body = ErrorResponse {
            success: false,
            error: self.error_type().to_string(),
            message,
            details,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
