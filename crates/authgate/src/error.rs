//! Unified error type for Authgate.

use std::path::PathBuf;

use authgate_session::{IdentityError, SessionError};
use authgate_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates `From` impls, so `?`
/// converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum AuthgateError {
    /// A transport-level error (address, accept, send).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A session-level error (admission, authentication state).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The identity service failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Bad or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client didn't authenticate within its configured timeout.
    #[error("authentication timed out")]
    AuthTimeout,
}

/// Errors loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let authgate_err: AuthgateError = err.into();
        assert!(matches!(authgate_err, AuthgateError::Transport(_)));
        assert!(authgate_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_identity_error() {
        let err = IdentityError::IssueFailed("not logged in".into());
        let authgate_err: AuthgateError = err.into();
        assert!(matches!(authgate_err, AuthgateError::Identity(_)));
        assert!(authgate_err.to_string().contains("not logged in"));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::ServerFull { capacity: 100 };
        let authgate_err: AuthgateError = err.into();
        assert!(matches!(authgate_err, AuthgateError::Session(_)));
        assert_eq!(authgate_err.to_string(), "server full (100 connections)");
    }

    #[test]
    fn test_from_config_error() {
        let err = ConfigError::Invalid("max_connections must be positive".into());
        let authgate_err: AuthgateError = err.into();
        assert!(matches!(authgate_err, AuthgateError::Config(_)));
    }
}
