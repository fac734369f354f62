//! Unified error handling for the gateway probe
//!
//! Every codec, transport session and polling consumer reports failures
//! through [`GatewayError`]. The variants follow the recovery policy of the
//! consumer loop: connection errors reconnect, transient and decode errors
//! skip the current poll, and only fatal incompatibility aborts.

use thiserror::Error;

// ============================================================================
// GatewayError - Main error type
// ============================================================================

/// Main error type for all gateway probe crates
#[derive(Debug, Error)]
pub enum GatewayError {
    // ======================================
    // Transport Errors
    // ======================================
    /// Transport cannot be established, or was lost mid-session.
    #[error("Connection failed: {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A single poll's read failed or reported a protocol-level error.
    #[error("Transient read error: {0}")]
    TransientRead(String),

    // ======================================
    // Decode Errors
    // ======================================
    /// A successfully read frame cannot be decoded.
    #[error("Malformed frame: {reason} (expected {expected}, got {actual})")]
    MalformedFrame {
        expected: String,
        actual: String,
        reason: String,
    },

    // ======================================
    // Fatal Errors
    // ======================================
    /// The protocol surface is unusable (required capability absent).
    #[error("Fatal incompatibility: {0}")]
    FatalIncompatibility(String),

    // ======================================
    // Configuration & I/O Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using GatewayError
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Connection error for an endpoint
    pub fn connection(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient read error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientRead(msg.into())
    }

    /// Frame shorter than the layout requires
    pub fn short_frame(unit: &str, expected: usize, actual: usize) -> Self {
        Self::MalformedFrame {
            expected: format!("{} {}", expected, unit),
            actual: format!("{} {}", actual, unit),
            reason: "frame too short".to_string(),
        }
    }

    /// Frame field holding a value the reading model does not allow
    pub fn malformed(
        reason: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::MalformedFrame {
            expected: expected.into(),
            actual: actual.into(),
            reason: reason.into(),
        }
    }

    /// Fatal incompatibility error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalIncompatibility(msg.into())
    }

    /// Configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Error category used by the consumer to choose a recovery path
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::TransientRead(_) => ErrorCategory::Transient,
            Self::MalformedFrame { .. } => ErrorCategory::Decode,
            Self::FatalIncompatibility(_) => ErrorCategory::Fatal,
            Self::Configuration(_) => ErrorCategory::Configuration,
            // Raw I/O failures surface from sockets, so they count as lost transport
            Self::Io(_) => ErrorCategory::Connection,
        }
    }

    /// Check if the consumer should keep polling after this error;
    /// anything else terminates it
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Transient | ErrorCategory::Decode
        )
    }

    /// Stable error code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::TransientRead(_) => "TRANSIENT_READ_ERROR",
            Self::MalformedFrame { .. } => "MALFORMED_FRAME",
            Self::FatalIncompatibility(_) => "FATAL_INCOMPATIBILITY",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Get log level
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Fatal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Connection | ErrorCategory::Transient | ErrorCategory::Decode => {
                Level::WARN
            },
        }
    }

    /// Process exit status when this error ends the program
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Configuration => 2,
            _ => 1,
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(format!("JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("YAML: {}", err))
    }
}

impl From<std::net::AddrParseError> for GatewayError {
    fn from(err: std::net::AddrParseError) -> Self {
        Self::Configuration(format!("Invalid socket address: {}", err))
    }
}

/// Error category enum - used for classification and recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Reconnect with backoff
    Connection,
    /// Skip this poll
    Transient,
    /// Discard this frame
    Decode,
    /// Abort the consumer
    Fatal,
    /// Abort before any consumer starts
    Configuration,
}
