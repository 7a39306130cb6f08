//! Error taxonomy shared across Cadence layers

use serde::{Deserialize, Serialize};

/// How a failure should be treated by retry, breaker and queue layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccup, timeout, resource exhaustion. Safe to retry.
    Transient,
    /// The external dependency is unavailable (or its circuit is open).
    DependencyDown,
    /// Bad configuration, invalid payload, auth/validation failure. Never retried.
    Fatal,
}

impl ErrorClass {
    /// Whether a retry loop may attempt the operation again
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::DependencyDown)
    }

    /// Whether the failure says something about the health of the dependency
    pub fn counts_against_dependency(self) -> bool {
        matches!(self, Self::Transient | Self::DependencyDown)
    }
}

/// Errors that know their own [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl Classify for std::io::Error {
    fn class(&self) -> ErrorClass {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => ErrorClass::Transient,
            ErrorKind::ConnectionRefused | ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => {
                ErrorClass::DependencyDown
            }
            _ => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::DependencyDown.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }

    #[test]
    fn test_io_error_classification() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(timeout.class(), ErrorClass::Transient);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
        assert_eq!(refused.class(), ErrorClass::DependencyDown);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "auth");
        assert!(!denied.is_retryable());
    }
}
