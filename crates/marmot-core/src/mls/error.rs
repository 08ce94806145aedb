//! MLS boundary error types.

use thiserror::Error;

use crate::error::{EngineError, ErrorKind};

/// Errors that can occur during MLS operations.
///
/// Transience is a property of the variant. The controller retries
/// transient failures after the group makes progress; fatal failures are
/// surfaced to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MlsError {
    /// TLS (de)serialization of an MLS message failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Application payload codec failure
    #[error("payload codec error: {0}")]
    Codec(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Provider storage failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Credential is malformed or does not bind to the claimed key
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Operation requires a group that has not been established
    #[error("group not established")]
    NoGroup,

    /// Wrapper addressed a group this identity does not hold
    #[error("unknown group: {group_id_hex}")]
    UnknownGroup {
        /// The unrecognized group id
        group_id_hex: String,
    },

    /// Wrapper is from a future epoch; retry after catching up
    #[error("epoch ahead: wrapper at {received}, group at {current}")]
    FutureEpoch {
        /// Epoch the wrapper was produced at
        received: u64,
        /// The group's current epoch
        current: u64,
    },

    /// Wrapper could not be processed while a commit awaits merge
    #[error("wrapper blocked on pending commit merge")]
    PendingMerge,

    /// A second remote commit arrived before the first was merged
    #[error("a pending commit already exists")]
    PendingCommitExists,

    /// Merge requested with nothing staged
    #[error("no pending commit to merge")]
    NoPendingCommit,

    /// Welcome is stale (prior epoch) or addresses a different key package
    #[error("stale welcome: {0}")]
    StaleWelcome(String),

    /// The local member was removed from the group
    #[error("removed from group")]
    RemovedFromGroup,

    /// Member lookup by pubkey failed
    #[error("member not found: {pubkey}")]
    MemberNotFound {
        /// The missing member
        pubkey: String,
    },

    /// Member is already part of the roster
    #[error("member already present: {pubkey}")]
    MemberAlreadyPresent {
        /// The duplicate member
        pubkey: String,
    },
}

impl MlsError {
    /// Returns true if this error may succeed on retry after the group
    /// makes progress (epoch advance, commit merge).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MlsError::FutureEpoch { .. }
                | MlsError::PendingMerge
                | MlsError::PendingCommitExists
                | MlsError::StaleWelcome(_)
        )
    }
}

impl From<MlsError> for EngineError {
    fn from(err: MlsError) -> EngineError {
        let kind = if err.is_transient() { ErrorKind::TransientMls } else { ErrorKind::FatalCrypto };
        EngineError::new(kind, err.to_string()).with_source(err)
    }
}
