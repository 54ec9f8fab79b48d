//! Error types for Tether
//!
//! Every failure raised while parsing an address, dispatching it to a
//! transport, establishing a connection, or transferring a file is a variant
//! of [`TetherError`]. Callers can tell "could not even attempt" apart from
//! "attempted and failed" with [`TetherError::is_attempt_failure`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a file transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailure {
    /// Source path does not exist
    NotFound,
    /// Source not readable or destination not writable
    PermissionDenied,
    /// The underlying connection dropped mid-transfer
    ConnectionLost,
    /// Any other I/O failure
    Other,
}

impl TransferFailure {
    /// Classify a local I/O error
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => Self::ConnectionLost,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "path not found",
            Self::PermissionDenied => "permission denied",
            Self::ConnectionLost => "connection lost mid-transfer",
            Self::Other => "transfer failed",
        };
        f.write_str(name)
    }
}

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// Address string has no recognizable `scheme:` prefix
    #[error("Malformed address '{address}': {message}")]
    AddressFormat { address: String, message: String },

    /// No transport registered for the scheme
    #[error("No transport registered for scheme '{0}'")]
    UnknownScheme(String),

    /// A transport is already registered for the scheme
    #[error("A transport is already registered for scheme '{0}'")]
    DuplicateScheme(String),

    /// Neither strategy of a transport can be used here
    #[error("Transport '{scheme}' unavailable: {message}")]
    TransportUnavailable { scheme: String, message: String },

    /// Authentication rejected by the remote side
    #[error("Authentication failed for '{user}@{host}': {message}")]
    AuthenticationError {
        user: String,
        host: String,
        message: String,
    },

    /// Remote host identity could not be verified
    #[error("Host key verification failed for '{host}': {message}")]
    HostKeyError { host: String, message: String },

    /// Connection refused, unreachable or dropped during establishment
    #[error("Connection error to '{host}': {message}")]
    ConnectionError { host: String, message: String },

    /// Accelerated file transfer failed
    #[error("File transfer failed for '{path}' ({kind}): {message}")]
    FileTransfer {
        path: String,
        kind: TransferFailure,
        message: String,
    },

    /// Operation not offered by this transport
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Connection attempt exceeded its deadline
    #[error("Connection to '{host}' timed out after {}", humantime::format_duration(*.after))]
    Timeout { host: String, after: Duration },

    /// Malformed option value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error with context
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TetherError {
    /// Create an address format error
    pub fn address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AddressFormat {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(
        user: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::AuthenticationError {
            user: user.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a host key error
    pub fn host_key(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HostKeyError {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a transport-unavailable error
    pub fn unavailable(scheme: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            scheme: scheme.into(),
            message: message.into(),
        }
    }

    /// Create a file transfer error
    pub fn transfer(
        path: impl Into<String>,
        kind: TransferFailure,
        message: impl Into<String>,
    ) -> Self {
        Self::FileTransfer {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a file transfer error from a local I/O failure
    pub fn transfer_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        Self::FileTransfer {
            path: path.display().to_string(),
            kind: TransferFailure::from_io(&err),
            message: err.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True if a connection was actually attempted and then failed.
    ///
    /// Callers use this to decide between falling back to another transport
    /// or strategy and surfacing a fatal error.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationError { .. }
                | Self::HostKeyError { .. }
                | Self::ConnectionError { .. }
                | Self::Timeout { .. }
        )
    }

    /// Failure kind, if this is a file transfer error
    pub fn transfer_failure(&self) -> Option<TransferFailure> {
        match self {
            Self::FileTransfer { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::ConfigError(err.to_string())
    }
}

/// Extension trait for adding context to std::io::Result
pub trait IoResultExt<T> {
    /// Add context to an I/O error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TetherError::io(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_failures() {
        assert!(TetherError::connection("h", "refused").is_attempt_failure());
        assert!(TetherError::auth("u", "h", "denied").is_attempt_failure());
        assert!(TetherError::host_key("h", "unknown").is_attempt_failure());

        assert!(!TetherError::UnknownScheme("x".into()).is_attempt_failure());
        assert!(!TetherError::address("x", "no scheme").is_attempt_failure());
        assert!(!TetherError::unavailable("smb", "none").is_attempt_failure());
    }

    #[test]
    fn test_transfer_classification() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = TetherError::transfer_io("/tmp/x", missing);
        assert_eq!(err.transfer_failure(), Some(TransferFailure::NotFound));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(TransferFailure::from_io(&denied), TransferFailure::PermissionDenied);

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(TransferFailure::from_io(&reset), TransferFailure::ConnectionLost);
    }

    #[test]
    fn test_timeout_message() {
        let err = TetherError::Timeout {
            host: "example.com".into(),
            after: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Connection to 'example.com' timed out after 5s");
    }
}
