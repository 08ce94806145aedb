//! Engine error taxonomy.
//!
//! Every failure the engine can surface falls into one of five kinds;
//! transience and the suggested recovery action are functions of the
//! kind, never of message text. Transient errors are handled inside the
//! engine (retry queues, backoff) and reach the host only as non-fatal
//! notices; fatal errors stop the engine until shutdown.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out-of-order MLS wrapper or missing prerequisite; retried after
    /// epoch advance
    TransientMls,
    /// Transport churn (reset stream, not found); retried with backoff
    TransientTransport,
    /// Invalid signature, removed from group, broken credential
    FatalCrypto,
    /// Malformed URL, invalid secret, inconsistent session parameters
    FatalConfig,
    /// Bootstrap did not complete within its wall-clock bound
    HandshakeTimeout,
}

impl ErrorKind {
    /// Whether errors of this kind may succeed on retry.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientMls | ErrorKind::TransientTransport)
    }

    /// Recovery hint surfaced to the host for this kind.
    pub fn recovery(self) -> RecoveryAction {
        match self {
            ErrorKind::TransientMls | ErrorKind::TransientTransport => RecoveryAction::None,
            ErrorKind::FatalCrypto => RecoveryAction::Refresh,
            ErrorKind::FatalConfig => RecoveryAction::None,
            ErrorKind::HandshakeTimeout => RecoveryAction::Refresh,
        }
    }
}

/// What the host should do about a surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Retry the triggering operation
    Retry,
    /// Re-initialize the engine (refresh)
    Refresh,
    /// Inspect network connectivity
    CheckConnection,
    /// Nothing actionable
    None,
}

/// An engine-level error with its classification.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct EngineError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
    /// Underlying cause, when one exists
    #[source]
    pub source: Option<Box<dyn std::error::Error>>,
}

impl EngineError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> EngineError {
        EngineError { kind, message: message.into(), source: None }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + 'static) -> EngineError {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether this error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Whether this error stops the engine.
    pub fn is_fatal(&self) -> bool {
        !self.kind.is_transient()
    }

    /// Recovery hint for the host.
    pub fn recovery(&self) -> RecoveryAction {
        self.kind.recovery()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_follows_kind() {
        assert!(EngineError::new(ErrorKind::TransientMls, "future epoch").is_transient());
        assert!(EngineError::new(ErrorKind::TransientTransport, "reset").is_transient());
        assert!(EngineError::new(ErrorKind::FatalCrypto, "bad signature").is_fatal());
        assert!(EngineError::new(ErrorKind::FatalConfig, "bad url").is_fatal());
        assert!(EngineError::new(ErrorKind::HandshakeTimeout, "60s").is_fatal());
    }

    #[test]
    fn fatal_crypto_recommends_refresh() {
        assert_eq!(
            EngineError::new(ErrorKind::FatalCrypto, "removed").recovery(),
            RecoveryAction::Refresh
        );
        assert_eq!(
            EngineError::new(ErrorKind::HandshakeTimeout, "timeout").recovery(),
            RecoveryAction::Refresh
        );
    }
}
