//! Error handling for the kvq job queue.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - User-facing vs internal messages and structured details
//! - Severity-aware logging through `tracing`
//! - An error counter through `metrics`
//!
//! The queue core never retries on its own. [`ErrorCode::StoreUnavailable`]
//! travels to the caller unchanged, [`ErrorCode::ClaimConflict`] means "try the
//! next candidate", and [`ErrorCode::MalformedRecord`] is always surfaced since it
//! hides a job from every worker.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kvq_core::error::{KvqError, Result, ErrorContext};
//!
//! fn load(bytes: &[u8]) -> Result<Value> {
//!     serde_json::from_slice(bytes).with_error_code(ErrorCode::MalformedRecord)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for kvq operations.
pub type Result<T> = std::result::Result<T, KvqError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Store Errors (1000-1099)
    StoreUnavailable,
    StoreError,

    // Lease Errors (1100-1199)
    ClaimConflict,

    // Record Errors (1200-1299)
    MalformedRecord,
    NotFound,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Validation Errors (4100-4199)
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::StoreUnavailable => 1000,
            Self::StoreError => 1001,

            Self::ClaimConflict => 1100,

            Self::MalformedRecord => 1200,
            Self::NotFound => 1201,

            Self::SerializationError => 2200,

            Self::InvalidInput => 4100,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable by the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::ClaimConflict)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "store",
            1100..=1199 => "lease",
            1200..=1299 => "record",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes (lost races, already-released locks)
    Low,
    /// Caller mistakes (bad input)
    Medium,
    /// System errors (store failures, bad configuration)
    High,
    /// Data problems requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ClaimConflict | ErrorCode::NotFound => Self::Low,

            ErrorCode::InvalidInput => Self::Medium,

            ErrorCode::StoreUnavailable
            | ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::MalformedRecord | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job id, store key, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for kvq.
#[derive(Error, Debug)]
pub struct KvqError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for KvqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl KvqError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create an input validation error.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Shorthand for `code() == ErrorCode::ClaimConflict`.
    pub fn is_claim_conflict(&self) -> bool {
        self.code == ErrorCode::ClaimConflict
    }

    /// Shorthand for `code() == ErrorCode::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "kvq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| KvqError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| KvqError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| KvqError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| KvqError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for KvqError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
        {
            (ErrorCode::StoreUnavailable, "Unable to reach the key-value store")
        } else if error.is_timeout() {
            (ErrorCode::StoreUnavailable, "Key-value store operation timed out")
        } else {
            (ErrorCode::StoreError, "The key-value store rejected the operation")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for KvqError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::MalformedRecord
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for KvqError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            "Key-value store operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for KvqError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::TimedOut => (ErrorCode::StoreUnavailable, "Operation timed out"),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => (ErrorCode::StoreUnavailable, "Connection failed"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for KvqError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<KvqError>() {
            Ok(kvq_error) => kvq_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for KvqError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl KvqError {
    /// The store could not be reached or did not answer.
    pub fn store_unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            format!("Key-value store '{}' is unavailable", backend),
            reason,
        )
        .with_context("backend", backend)
    }

    /// An optimistic claim lost the race for a job.
    pub fn claim_conflict(job_id: impl Into<String>, worker: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let worker = worker.into();
        Self::new(
            ErrorCode::ClaimConflict,
            format!("Job {} was claimed or modified before {} could claim it", job_id, worker),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", &job_id)
                .with_context("worker", &worker)
                .with_suggestion("Discard this candidate and try the next one"),
        )
    }

    /// A save whose record was moved, rewritten or removed after it was read.
    pub fn stale_write(job_id: impl Into<String>, key: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self::with_internal(
            ErrorCode::ClaimConflict,
            format!("Job {} changed since it was read", job_id),
            format!("revision guard failed on {}", key.into()),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", &job_id)
                .with_suggestion("Reload the job before saving it again"),
        )
    }

    /// A stored value or key could not be parsed into a job record.
    pub fn malformed_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::MalformedRecord,
            format!("Stored job record is malformed: {}", key),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("key", &key))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
