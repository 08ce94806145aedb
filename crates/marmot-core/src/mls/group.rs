//! Per-group engine state.
//!
//! Wraps one OpenMLS group with the engine-level state the protocol needs
//! beyond raw MLS: the lifecycle phase, the admin set, and the stash for
//! at most one remote commit awaiting merge.
//!
//! # Invariants
//!
//! - Epoch only increases; a merge advances it by exactly one.
//! - At most one pending commit exists at any moment.
//! - A member's pubkey uniquely identifies them within the roster.

use std::collections::BTreeSet;

use openmls::prelude::*;
use serde::{Deserialize, Serialize};

use super::error::MlsError;

/// Lifecycle of the local member within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    /// Welcome accepted is pending; no epoch yet
    Joining,
    /// Full member at the group's current epoch
    Active,
    /// A merged commit removed the local member
    Removed,
}

/// One roster entry as surfaced to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member pubkey (x-only, lowercase hex)
    pub pubkey: String,
    /// Whether the member holds admin rights
    #[serde(default)]
    pub is_admin: bool,
}

/// Engine state for a single MLS group.
pub(crate) struct GroupState {
    /// The OpenMLS group holding all ratchet state
    pub(crate) mls_group: MlsGroup,
    /// Admin pubkeys; changes only alongside invite/remove commits
    pub(crate) admins: BTreeSet<String>,
    /// Remote commit processed but not yet merged
    staged_remote: Option<Box<StagedCommit>>,
    /// Local member lifecycle
    pub(crate) phase: GroupPhase,
}

impl GroupState {
    pub(crate) fn new(mls_group: MlsGroup, admins: BTreeSet<String>) -> GroupState {
        GroupState { mls_group, admins, staged_remote: None, phase: GroupPhase::Active }
    }

    /// Current epoch number.
    pub(crate) fn epoch(&self) -> u64 {
        self.mls_group.epoch().as_u64()
    }

    /// Group identifier as lowercase hex.
    pub(crate) fn group_id_hex(&self) -> String {
        hex::encode(self.mls_group.group_id().as_slice())
    }

    /// Whether a remote commit awaits merge.
    pub(crate) fn has_pending_commit(&self) -> bool {
        self.staged_remote.is_some()
    }

    /// Stash a processed remote commit for a later merge.
    ///
    /// # Errors
    ///
    /// Returns [`MlsError::PendingCommitExists`] if one is already
    /// stashed; the at-most-one invariant is enforced here.
    pub(crate) fn stash_commit(&mut self, staged: Box<StagedCommit>) -> Result<(), MlsError> {
        if self.staged_remote.is_some() {
            return Err(MlsError::PendingCommitExists);
        }
        self.staged_remote = Some(staged);
        Ok(())
    }

    /// Take the stashed commit, if any.
    pub(crate) fn take_staged_commit(&mut self) -> Option<Box<StagedCommit>> {
        self.staged_remote.take()
    }

    /// The roster with admin flags, ordered by leaf index.
    pub(crate) fn members(&self) -> Vec<MemberInfo> {
        self.mls_group
            .members()
            .filter_map(|member| credential_pubkey(&member.credential))
            .map(|pubkey| {
                let is_admin = self.admins.contains(&pubkey);
                MemberInfo { pubkey, is_admin }
            })
            .collect()
    }

    /// Leaf index of the member with the given pubkey.
    pub(crate) fn member_index(&self, pubkey: &str) -> Option<LeafNodeIndex> {
        self.mls_group
            .members()
            .find(|member| credential_pubkey(&member.credential).as_deref() == Some(pubkey))
            .map(|member| member.index)
    }

    /// Pubkey of the member at the given leaf index.
    pub(crate) fn member_pubkey(&self, index: LeafNodeIndex) -> Option<String> {
        self.mls_group
            .members()
            .find(|member| member.index == index)
            .and_then(|member| credential_pubkey(&member.credential))
    }

    /// Grant or revoke admin rights in the engine's admin set.
    pub(crate) fn set_admin(&mut self, pubkey: &str, is_admin: bool) {
        if is_admin {
            self.admins.insert(pubkey.to_string());
        } else {
            self.admins.remove(pubkey);
        }
    }

    /// Replace the admin set wholesale (applying a received update).
    pub(crate) fn set_admins(&mut self, admins: BTreeSet<String>) {
        self.admins = admins;
    }
}

/// Extract the identity pubkey from a basic credential.
pub(crate) fn credential_pubkey(credential: &Credential) -> Option<String> {
    match credential.credential_type() {
        CredentialType::Basic => BasicCredential::try_from(credential.clone())
            .ok()
            .and_then(|basic| String::from_utf8(basic.identity().to_vec()).ok()),
        _ => None,
    }
}
