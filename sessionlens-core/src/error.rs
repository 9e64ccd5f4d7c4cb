//! Error types for SessionLens operations
//!
//! Only configuration loading, adapter installation and report delivery
//! produce these errors. Capture paths never surface an error to the host
//! application, and errors raised by intercepted host primitives are passed
//! back to their caller untouched rather than converted.

/// Result type for SessionLens operations
pub type Result<T> = std::result::Result<T, SessionLensError>;

/// Error types for the capture-and-report engine
#[derive(Debug, thiserror::Error)]
pub enum SessionLensError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The collector answered with a non-2xx status
    #[error("Report delivery failed with status {status}")]
    Delivery { status: u16 },

    /// Transport-level failure while delivering a report
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// An interception adapter was installed twice
    #[error("Adapter already installed: {0}")]
    AlreadyInstalled(&'static str),

    /// An interception adapter was removed without being installed
    #[error("Adapter not installed: {0}")]
    NotInstalled(&'static str),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for SessionLensError {
    fn from(s: String) -> Self {
        SessionLensError::Other(s)
    }
}

impl From<&str> for SessionLensError {
    fn from(s: &str) -> Self {
        SessionLensError::Other(s.to_string())
    }
}

impl From<figment::Error> for SessionLensError {
    fn from(err: figment::Error) -> Self {
        SessionLensError::Configuration(err.to_string())
    }
}
