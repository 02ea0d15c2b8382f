//! Error types for tilecast.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while deciding or delivering display content.
#[derive(Debug, Error)]
pub enum Error {
    /// No device with this id exists in the store
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Configuration file or value is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem operation failed (image cache, static images)
    #[error("I/O error: {0}")]
    Io(String),

    /// The rendering collaborator failed
    #[error("render failed: {0}")]
    Render(String),

    /// The rendering collaborator did not finish within its budget
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),

    /// JSON or YAML serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reading from or writing to a device connection failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Persistence layer rejected an operation
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether this error ends a device session.
    ///
    /// Render problems are scoped to a single rotation candidate and never
    /// terminate a connection.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::DeviceNotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceNotFound("abc123".to_string());
        assert!(err.to_string().contains("abc123"));

        let err = Error::RenderTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_session_fatality() {
        assert!(Error::Transport("closed".into()).is_fatal_to_session());
        assert!(Error::DeviceNotFound("x".into()).is_fatal_to_session());
        assert!(!Error::Render("boom".into()).is_fatal_to_session());
        assert!(!Error::RenderTimeout(Duration::from_secs(1)).is_fatal_to_session());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.webp");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("missing.webp")));
    }
}
