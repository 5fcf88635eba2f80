use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found", resource.into()),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigValidationError, message)
    }

    pub fn service_unavailable(service: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ServiceUnavailable,
            format!("{} service unavailable", service.into()),
        )
    }

    pub fn connection(slot: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
            .with_details(serde_json::json!({ "slot": slot }))
    }

    pub fn send(slot: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SendError, message).with_details(serde_json::json!({ "slot": slot }))
    }

    pub fn no_connectivity() -> Self {
        Self::new(
            ErrorCode::NoConnectivity,
            "No model connection is open; reconnect before sending",
        )
    }

    pub fn slot_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SlotLimit, message)
    }

    pub fn slot_out_of_range(slot: usize, count: usize) -> Self {
        Self::bad_request(format!("Slot {} out of range (slot count {})", slot, count))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    NotFound,
    Conflict,
    ConfigValidationError,
    NoConnectivity,
    SlotLimit,

    // Server errors (5xx)
    Internal,
    ServiceUnavailable,
    ExternalServiceError,

    // Slot transport
    ConnectionError,
    SendError,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ConfigValidationError => 422,
            Self::NoConnectivity => 409,
            Self::SlotLimit => 409,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
            Self::ExternalServiceError => 502,
            Self::ConnectionError => 502,
            Self::SendError => 502,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.http_status() < 500
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ConfigValidationError => "CONFIG_VALIDATION_ERROR",
            Self::NoConnectivity => "NO_CONNECTIVITY",
            Self::SlotLimit => "SLOT_LIMIT",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::SendError => "SEND_ERROR",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// Error Response for HTTP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: AppError,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: AppError) -> Self {
        Self {
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// Validation Error Details
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: "INVALID".to_string(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: vec![] }
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.into_app_error())
        }
    }

    pub fn into_app_error(self) -> AppError {
        let fields = self
            .errors
            .iter()
            .map(|e| e.field.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let message = format!("Invalid configuration: {}", fields);
        match serde_json::to_value(&self) {
            Ok(details) => AppError::validation(message).with_details(details),
            Err(_) => AppError::validation(message),
        }
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::service_unavailable(format!("Upstream ({})", err))
        } else if err.status().map(|s| s.as_u16()) == Some(404) {
            Self::not_found("Upstream resource")
        } else {
            Self::new(
                ErrorCode::ExternalServiceError,
                format!("Upstream error: {}", err),
            )
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {}", err))
    }
}

// ============================================================================
// Backend-specific HTTP Response Conversion
// ============================================================================

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(&self);
        let response = ErrorResponse::new(self);

        (status, Json(response)).into_response()
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<AppError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &AppError) {
    if error.code.is_server_error() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::not_found("Session");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("Session"));
    }

    #[test]
    fn test_slot_errors_carry_slot() {
        let err = AppError::connection(2, "handshake refused");
        assert_eq!(err.code, ErrorCode::ConnectionError);
        assert_eq!(err.details, Some(serde_json::json!({ "slot": 2 })));

        let err = AppError::send(1, "pipe closed");
        assert_eq!(err.code, ErrorCode::SendError);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorCode::NoConnectivity.http_status(), 409);
        assert_eq!(ErrorCode::ConfigValidationError.http_status(), 422);
        assert_eq!(ErrorCode::ConnectionError.http_status(), 502);
    }

    #[test]
    fn test_error_classification() {
        assert!(ErrorCode::NoConnectivity.is_client_error());
        assert!(ErrorCode::SendError.is_server_error());
    }

    #[test]
    fn test_validation_errors() {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::new("model", "Model is required"));
        errors.add(ValidationError::new("temperature", "Out of range").with_code("RANGE"));
        assert_eq!(errors.errors.len(), 2);

        let app_error = errors.into_app_error();
        assert_eq!(app_error.code, ErrorCode::ConfigValidationError);
        assert!(app_error.message.contains("model, temperature"));
        assert!(app_error.details.is_some());
    }

    #[test]
    fn test_empty_validation_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::no_connectivity();
        let display = format!("{}", err);
        assert!(display.contains("NO_CONNECTIVITY"));
    }

    #[test]
    fn test_context() {
        let res: std::result::Result<(), AppError> = Err(AppError::internal("boom"));
        let err = res.context("saving slot 0").unwrap_err();
        assert_eq!(err.message, "saving slot 0: boom");
    }
}
