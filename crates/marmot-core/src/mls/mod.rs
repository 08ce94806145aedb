//! Identity and MLS group state (the engine's single owner of all MLS
//! cryptographic material).
//!
//! # Architecture
//!
//! - [`identity`]: the MLS handle: key packages, group create/join,
//!   wrapper encrypt/ingest, commits, exporter
//! - [`group`]: per-group engine state (lifecycle, admin set, pending
//!   remote commit)
//! - [`provider`]: OpenMLS provider wired to the [`Environment`] RNG
//! - [`error`]: MLS-boundary error types with transience classification
//!
//! # Design Principles
//!
//! 1. One owner: only [`identity::Identity`] mutates MLS state; the
//!    controller holds a mutable borrow for the duration of an operation.
//! 2. Epoch monotonicity: merging a commit advances the epoch by exactly
//!    one; nothing ever rolls it back.
//! 3. Typed transience: out-of-order wrappers are classified by comparing
//!    epochs, never by inspecting error strings.
//!
//! [`Environment`]: crate::env::Environment

pub mod error;
pub mod group;
pub mod identity;
pub mod provider;

pub use error::MlsError;
pub use group::{GroupPhase, MemberInfo};
pub use identity::{
    AddMembersArtifacts, CommitDescriptor, GroupCreation, Identity, KeyPackageOffer,
    MergeOutcome, WrapperOutcome, GROUP_ROOT_LABEL, MEDIA_BASE_LABEL,
};
pub use provider::MlsProvider;
