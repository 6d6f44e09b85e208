//! Error handling for Conveyor Core.
//!
//! This module provides:
//! - `ConveyorError`, the infrastructure error raised by collaborators
//!   (broker, flag store, health evaluator, cancellation store, process control)
//! - Machine-readable error codes grouped by category
//! - User-facing vs internal messages
//! - Error logging with tracing integration and an error counter
//!
//! Job outcomes are not modelled here; see [`crate::jobs::JobError`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::error::{ConveyorError, ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<u64> {
//!     std::fs::read_to_string("/proc/self/status")
//!         .context("Failed to read process status")?;
//!     Ok(0)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Pipeline Errors (1000-1099)
    UnknownWorker,
    UnroutedShardCall,
    InvalidJob,

    // Broker Errors (1100-1199)
    BrokerError,
    BrokerConnectionFailed,

    // Collaborator Errors (1200-1299)
    FeatureFlagError,
    HealthCheckFailed,
    CancellationStoreError,

    // Process Errors (1300-1399)
    ProcessInspectionFailed,
    SignalDeliveryFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::UnknownWorker => 1000,
            Self::UnroutedShardCall => 1001,
            Self::InvalidJob => 1002,

            Self::BrokerError => 1100,
            Self::BrokerConnectionFailed => 1101,

            Self::FeatureFlagError => 1200,
            Self::HealthCheckFailed => 1201,
            Self::CancellationStoreError => 1202,

            Self::ProcessInspectionFailed => 1300,
            Self::SignalDeliveryFailed => 1301,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerError
                | Self::BrokerConnectionFailed
                | Self::FeatureFlagError
                | Self::HealthCheckFailed
                | Self::CancellationStoreError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "pipeline",
            1100..=1199 => "broker",
            1200..=1299 => "collaborator",
            1300..=1399 => "process",
            2200..=2299 => "serialization",
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
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main infrastructure error type for Conveyor Core.
#[derive(Error, Debug)]
pub struct ConveyorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short description safe to surface to operators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConveyorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConveyorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
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
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// The job names a worker type nobody registered.
    pub fn unknown_worker(worker: impl Into<String>) -> Self {
        let worker = worker.into();
        Self::new(ErrorCode::UnknownWorker, format!("Unknown worker: {}", worker))
    }

    /// An enqueue inside a shard-aware job did not name its destination shard.
    pub fn unrouted_shard_call(worker: impl Into<String>) -> Self {
        let worker = worker.into();
        Self::new(
            ErrorCode::UnroutedShardCall,
            format!("Enqueue of {} does not declare a destination shard", worker),
        )
    }

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error; retryable errors are warnings.
    pub fn log(&self) {
        if self.is_retryable() {
            warn!(
                error_code = %self.code,
                category = self.code.category(),
                message = %self.user_message,
                internal = self.internal_message.as_deref().unwrap_or(""),
                "Retryable error"
            );
        } else {
            error!(
                error_code = %self.code,
                category = self.code.category(),
                message = %self.user_message,
                internal = self.internal_message.as_deref().unwrap_or(""),
                source = self.source.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                "Error occurred"
            );
        }
    }

    fn record_metrics(&self) {
        counter!(
            "conveyor_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to results.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with the given message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConveyorError::internal(message).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| {
            let message = e.to_string();
            ConveyorError::with_internal(code, "Operation failed", message).with_source(e)
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConveyorError::internal(message))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConveyorError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for ConveyorError {
    fn from(error: redis::RedisError) -> Self {
        let code = if error.is_connection_refusal() || error.is_connection_dropped() {
            ErrorCode::BrokerConnectionFailed
        } else {
            ErrorCode::BrokerError
        };
        Self::with_internal(code, "Redis operation failed", error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "JSON processing failed", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for ConveyorError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::ProcessInspectionFailed, "I/O error", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for ConveyorError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", error))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
