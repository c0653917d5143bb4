//! Error types for the workflow engine core.

use thiserror::Error;

/// A single field/path-scoped validation complaint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Core engine error taxonomy. Every caller-distinguishable category from the
/// error handling design is represented as its own variant; ambient I/O
/// failures from the underlying libraries are folded in via `#[from]`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0:?}")]
    Validation(Vec<ValidationIssue>),

    #[error("business rule violated: {0}")]
    BusinessRule(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("condition error: {0}")]
    ConditionError(String),

    #[error("required resource could not be reserved: {0}")]
    Unreserved(String),

    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("external dependency unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("UUID parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        CoreError::Validation(issues)
    }

    pub fn validation_one(path: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation(vec![ValidationIssue::new(path, message)])
    }

    /// Stable machine-readable code, independent of the human `Display` text.
    /// An external HTTP layer maps these to status codes per the error
    /// handling design; the core itself never produces an HTTP response.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Validation(_) => "VALIDATION",
            CoreError::BusinessRule(_) => "BUSINESS_RULE",
            CoreError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            CoreError::ConditionError(_) => "CONDITION_ERROR",
            CoreError::Unreserved(_) => "UNRESERVED",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Timeout(_) => "TIMEOUT",
            CoreError::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Database(_) => "DATABASE",
            CoreError::Serialization(_) => "SERIALIZATION",
            CoreError::DateParse(_) => "DATE_PARSE",
            CoreError::UuidParse(_) => "UUID_PARSE",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
