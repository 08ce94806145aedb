//! Application payloads carried inside MLS wrappers.
//!
//! The engine never puts plaintext on a transport surface; everything in
//! this module is serialized and then encrypted into an MLS application
//! message. CBOR is used for the same reasons the rest of the protocol
//! prefers it: optional fields can be added without version negotiation,
//! and there is no code-execution surface in the format.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// A decrypted application payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPayload {
    /// Sender-reported unix timestamp (seconds)
    pub created_at: u64,
    /// The payload body
    pub content: AppContent,
}

/// Body of an application payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppContent {
    /// A user-visible text message
    Text(String),
    /// The encrypted directory announcing media tracks
    Directory(TrackDirectory),
    /// The authoritative admin roster, published alongside membership
    /// commits
    Admins(AdminUpdate),
}

/// The full admin set after a membership change.
///
/// Admin rights are engine state, not MLS tree state, so they ride the
/// encrypted channel: whoever builds a membership commit publishes the
/// resulting admin set right after it, and every member applies it at
/// the same epoch. Receivers accept an update only from a current admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdminUpdate {
    /// Pubkeys holding admin rights after the change
    pub admins: Vec<String>,
}

/// Announcement of the sender's live media tracks.
///
/// Audio track labels are never visible to the relay; members learn them
/// only through this directory, delivered inside the MLS channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackDirectory {
    /// Tracks currently published by the sender
    pub tracks: Vec<TrackAnnounce>,
}

/// One announced media track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackAnnounce {
    /// Publishing member
    pub pubkey: String,
    /// Track label under `<root>/audio/<pubkey>/`
    pub label: String,
}

impl AppPayload {
    /// Text payload stamped with the given time.
    pub fn text(body: impl Into<String>, created_at: u64) -> AppPayload {
        AppPayload { created_at, content: AppContent::Text(body.into()) }
    }

    /// Directory payload stamped with the given time.
    pub fn directory(directory: TrackDirectory, created_at: u64) -> AppPayload {
        AppPayload { created_at, content: AppContent::Directory(directory) }
    }

    /// Admin-roster payload stamped with the given time.
    pub fn admins(update: AdminUpdate, created_at: u64) -> AppPayload {
        AppPayload { created_at, content: AppContent::Admins(update) }
    }

    /// Encode to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborEncode`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborDecode`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<AppPayload> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_roundtrip() {
        let payload = AppPayload::text("Hello B", 1_700_000_123);
        let decoded = AppPayload::decode(&payload.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn directory_payload_roundtrip() {
        let payload = AppPayload::directory(
            TrackDirectory {
                tracks: vec![TrackAnnounce {
                    pubkey: "aa".repeat(32),
                    label: "mic-0".to_string(),
                }],
            },
            42,
        );
        let decoded = AppPayload::decode(&payload.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn admin_update_roundtrip() {
        let payload = AppPayload::admins(
            AdminUpdate { admins: vec!["aa".repeat(32), "bb".repeat(32)] },
            99,
        );
        let decoded = AppPayload::decode(&payload.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            AppPayload::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::CborDecode(_))
        ));
    }
}
