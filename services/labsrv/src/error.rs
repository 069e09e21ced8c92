//! Error handling for the lab interface service
//!
//! One enum for every failure class the core can observe. Transport and
//! interpretation errors are normally consumed internally (reconnect policy,
//! per-message logging); only configuration errors reach callers of
//! `ConnectionManager::connect`.

use thiserror::Error;

/// Lab Service Error Type
#[derive(Error, Debug, Clone)]
pub enum LabSrvError {
    /// Configuration-related errors (missing host/port, bad file)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Framing or checksum errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Data handling errors (parsing, conversion)
    #[error("Data error: {0}")]
    DataError(String),

    /// Connect, idle or liveness timeouts
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Result store errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Resource errors (queue overflow)
    #[error("Resource error: {0}")]
    ResourceError(String),

    /// Message interpretation errors (missing segment, bad field)
    #[error("Interpretation error: {0}")]
    InterpretationError(String),

    /// Connection state errors
    #[error("State error: {0}")]
    StateError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the lab service
pub type Result<T> = std::result::Result<T, LabSrvError>;

impl LabSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        LabSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LabSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LabSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LabSrvError::ConnectionError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        LabSrvError::DataError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LabSrvError::TimeoutError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        LabSrvError::StorageError(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        LabSrvError::ResourceError(msg.into())
    }

    pub fn interpretation(msg: impl Into<String>) -> Self {
        LabSrvError::InterpretationError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        LabSrvError::StateError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LabSrvError::InternalError(msg.into())
    }

    pub fn not_connected() -> Self {
        LabSrvError::ConnectionError("Not connected".to_string())
    }

    pub fn missing_segment(kind: &str) -> Self {
        LabSrvError::InterpretationError(format!("Missing {kind} segment"))
    }

    /// Transport-class errors feed the reconnect policy
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::IoError(_) | Self::ConnectionError(_) | Self::TimeoutError(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for LabSrvError {
    fn from(err: std::io::Error) -> Self {
        LabSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for LabSrvError {
    fn from(err: figment::Error) -> Self {
        LabSrvError::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for LabSrvError {
    fn from(err: sqlx::Error) -> Self {
        LabSrvError::StorageError(err.to_string())
    }
}

impl From<regex::Error> for LabSrvError {
    fn from(err: regex::Error) -> Self {
        LabSrvError::InternalError(format!("Regex: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for LabSrvError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        LabSrvError::TimeoutError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn connection_error(self, msg: &str) -> Result<T>;
    fn storage_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| LabSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| LabSrvError::StorageError(format!("{msg}: {e}")))
    }
}
