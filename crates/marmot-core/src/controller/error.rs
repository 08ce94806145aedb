//! Controller-level error classification.
//!
//! Invite validation gets its own typed enum: each rejection maps to a
//! distinct user message and every variant is transient (the user fixes
//! the input and retries). Nothing here inspects error message text.

use thiserror::Error;

/// Why an invite request was rejected before any MLS work happened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InviteError {
    /// No pubkey supplied
    #[error("pubkey required")]
    EmptyPubkey,

    /// Input did not parse as a hex or bech32 pubkey
    #[error("unparsable pubkey: {0}")]
    InvalidPubkey(String),

    /// The local member tried to invite itself
    #[error("cannot invite self")]
    SelfInvite,

    /// Target is already in the roster
    #[error("member already present")]
    AlreadyPresent,

    /// An invite for this pubkey is still in flight
    #[error("invite already pending")]
    AlreadyPending,

    /// Only admins may change membership
    #[error("not an admin of this group")]
    NotAdmin,

    /// No group exists yet to invite into
    #[error("group not established")]
    NoGroup,
}

impl InviteError {
    /// Message shown to the user for this rejection.
    pub fn user_message(&self) -> &'static str {
        match self {
            InviteError::EmptyPubkey => "Enter a participant pubkey before inviting.",
            InviteError::InvalidPubkey(_) => {
                "Invite pubkey is invalid. Use the participant's hex or npub key."
            }
            InviteError::SelfInvite => "You cannot invite your own key into the room.",
            InviteError::AlreadyPresent => "That participant is already in the roster.",
            InviteError::AlreadyPending => "An invite for that participant is still pending.",
            InviteError::NotAdmin => "Only admins can invite new participants.",
            InviteError::NoGroup => "Wait for the room to finish connecting before inviting.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_distinct_user_message() {
        let variants = [
            InviteError::EmptyPubkey,
            InviteError::InvalidPubkey("x".to_string()),
            InviteError::SelfInvite,
            InviteError::AlreadyPresent,
            InviteError::AlreadyPending,
            InviteError::NotAdmin,
            InviteError::NoGroup,
        ];
        let mut messages: Vec<&str> = variants.iter().map(|v| v.user_message()).collect();
        messages.sort_unstable();
        messages.dedup();
        assert_eq!(messages.len(), variants.len());
    }
}
