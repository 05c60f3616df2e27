//! Error types for the relay.
//!
//! Every adapter-boundary failure is converted into one of these kinds before
//! it reaches the control loop, and only configuration errors and total
//! handler exhaustion terminate the process. Everything else is logged or
//! filed and the loop continues.

use std::path::PathBuf;

use thiserror::Error;

use crate::broker::BrokerError;

/// Startup configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("cannot read {path}: {message}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error text.
        message: String,
    },

    /// A configuration file could not be parsed.
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// The offending path.
        path: PathBuf,
        /// Parser error text.
        message: String,
    },

    /// A handler declaration names a kind no factory is registered for.
    #[error("unknown handler kind '{kind}' for handler '{name}'")]
    UnknownHandlerKind {
        /// Declared handler name.
        name: String,
        /// The unrecognized kind identifier.
        kind: String,
    },

    /// Two handler declarations share a name.
    #[error("duplicate handler name '{name}'")]
    DuplicateHandler {
        /// The repeated name.
        name: String,
    },

    /// A handler declaration is malformed.
    #[error("invalid handler '{name}': {message}")]
    InvalidHandler {
        /// Declared handler name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// The broker list file contains no usable URIs.
    #[error("broker list {path} contains no URIs")]
    EmptyBrokerList {
        /// The list file path.
        path: PathBuf,
    },

    /// No broker target was configured.
    #[error("either a broker URI or a broker list file is required")]
    MissingBroker,

    /// A timeout relationship is inverted.
    #[error("invalid timeouts: {message}")]
    InvalidTimeouts {
        /// Which relationship is violated.
        message: String,
    },
}

/// Failure to establish a broker session. Recoverable: the control loop
/// retries after the connect cooldown.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connect attempt failed or timed out.
    #[error("connect to {uri} failed: {source}")]
    Connect {
        /// The broker URI attempted.
        uri: String,
        /// Adapter-level cause.
        source: BrokerError,
    },

    /// Subscription setup failed; the session was torn down with zero
    /// subscriptions left standing.
    #[error("subscription setup failed: {message}")]
    Subscribe {
        /// What went wrong (subscribe error or missing receipts).
        message: String,
    },
}

/// Top-level error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Fatal misconfiguration, aborts startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker connection failure; the loop reconnects after a cooldown.
    #[error("connection error: {0}")]
    Connection(#[from] BrokerError),

    /// Session setup failure; the loop aborts the session and reconnects.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Every handler has been deactivated; the relay has nothing left to do.
    #[error("no active handlers remain")]
    FatalExhaustion,
}

impl RelayError {
    /// Returns true if the error must terminate the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::FatalExhaustion)
    }

    /// Suggested process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RelayError::FatalExhaustion.is_fatal());
        assert!(RelayError::Config(ConfigError::MissingBroker).is_fatal());
        assert!(!RelayError::Connection(BrokerError::Closed).is_fatal());
        assert!(!RelayError::Session(SessionError::Subscribe {
            message: "missing receipts".to_string(),
        })
        .is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RelayError::Config(ConfigError::MissingBroker).exit_code(), 2);
        assert_eq!(RelayError::FatalExhaustion.exit_code(), 1);
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::Connect {
            uri: "stomp://broker:61613".to_string(),
            source: BrokerError::Timeout {
                operation: "connect",
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("stomp://broker:61613"));
        assert!(msg.contains("connect"));
    }
}
