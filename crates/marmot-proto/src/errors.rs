//! Error types for the Marmot wire protocol.
//!
//! All errors are structured and testable. Decode failures never panic;
//! they name the violated constraint.

use thiserror::Error;

/// Convenience alias for protocol-level results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol-level errors that can occur while encoding or decoding wire
/// data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Media frame is shorter than the minimum encodable size
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Relay event carries a kind other than the handshake kind
    #[error("unexpected event kind: {0}")]
    UnexpectedKind(u16),

    /// Relay event signature or id did not verify
    #[error("event verification failed: {0}")]
    EventVerification(String),

    /// Envelope content is not valid JSON for the tagged type
    #[error("invalid envelope content: {0}")]
    InvalidEnvelope(String),

    /// Track path does not match the `marmot/<hex>/...` layout
    #[error("invalid track path: {0}")]
    InvalidPath(String),

    /// A path element (pubkey, track label) contains forbidden characters
    #[error("invalid path element {element}: {reason}")]
    InvalidPathElement {
        /// Which element was rejected
        element: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Capability token is malformed or its claims did not verify
    #[error("invalid capability: {0}")]
    InvalidCapability(String),

    /// Capability is outside its validity window
    #[error("capability expired or not yet valid at {now}")]
    CapabilityExpired {
        /// Unix time the check was made at
        now: u64,
    },

    /// Failed to encode data as CBOR
    #[error("failed to encode CBOR: {0}")]
    CborEncode(String),

    /// Failed to decode CBOR data
    #[error("failed to decode CBOR: {0}")]
    CborDecode(String),
}
