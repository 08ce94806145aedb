//! Signed handshake envelopes for the signalling relay.
//!
//! Bootstrap traffic rides a dedicated event kind on the relay. Every
//! envelope is a Schnorr-signed event whose content is a JSON object
//! tagged with the bootstrap session, the sender role, and the message
//! type:
//!
//! ```text
//! { "session": "<channel id>", "from": "creator"|"invitee",
//!   "created_at": <unix secs>, "type": "<kebab-case type>", ... }
//! ```
//!
//! The relay itself is untrusted: it may reorder, duplicate, or drop
//! events. Receivers deduplicate by event id and verify the signature
//! before interpreting the content.

use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, Tag, TagKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{ProtocolError, Result};

/// Reserved relay event kind for bootstrap handshake envelopes.
pub const HANDSHAKE_KIND: u16 = 44501;

/// Which side of the bootstrap a session plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapRole {
    /// Creates the group and admits the invitee
    Creator,
    /// Publishes a key package and waits for a welcome
    Invitee,
}

impl BootstrapRole {
    /// The opposite side of the handshake.
    pub fn peer(self) -> BootstrapRole {
        match self {
            BootstrapRole::Creator => BootstrapRole::Invitee,
            BootstrapRole::Invitee => BootstrapRole::Creator,
        }
    }

    /// Stable wire string for relay tags.
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapRole::Creator => "creator",
            BootstrapRole::Invitee => "invitee",
        }
    }
}

/// Typed handshake message bodies.
///
/// The `type` field in the envelope JSON selects the variant; field names
/// follow the wire format of the original deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandshakePayload {
    /// Creator asks the invitee (or a specific member) for a key package.
    RequestKeyPackage {
        /// Target pubkey, when directed at one member
        #[serde(skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },

    /// Invitee publishes its signed key-package offer.
    KeyPackage {
        /// Signed key-package event, JSON-encoded
        event: String,
        /// Locally re-importable bundle (opaque, base64)
        #[serde(skip_serializing_if = "Option::is_none")]
        bundle: Option<String>,
        /// Offering member's pubkey
        #[serde(skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },

    /// Invitee heartbeat asking the creator to (re)send the welcome.
    RequestWelcome {
        /// Requesting member's pubkey
        #[serde(skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },

    /// Creator delivers the MLS welcome.
    Welcome {
        /// Serialized welcome (opaque, base64)
        welcome: String,
        /// Group identifier the welcome admits into
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id_hex: Option<String>,
        /// The group's transport root (`marmot/<hex>`), derived at the
        /// founding epoch; later joiners cannot re-derive it
        #[serde(skip_serializing_if = "Option::is_none")]
        moq_root: Option<String>,
        /// Intended recipient pubkey
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
    },
}

impl HandshakePayload {
    /// Wire string of this payload's type tag.
    pub fn type_str(&self) -> &'static str {
        match self {
            HandshakePayload::RequestKeyPackage { .. } => "request-key-package",
            HandshakePayload::KeyPackage { .. } => "key-package",
            HandshakePayload::RequestWelcome { .. } => "request-welcome",
            HandshakePayload::Welcome { .. } => "welcome",
        }
    }
}

/// A complete handshake envelope as carried in event content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeEnvelope {
    /// Bootstrap channel identifier correlating this exchange
    pub session: String,
    /// Sender role
    pub from: BootstrapRole,
    /// Sender-reported unix timestamp (seconds)
    pub created_at: u64,
    /// The typed message body
    #[serde(flatten)]
    pub payload: HandshakePayload,
}

impl HandshakeEnvelope {
    /// Sign this envelope into a relay event.
    ///
    /// The content is the envelope JSON; the `t`, `type`, and `role` tags
    /// duplicate the routing fields so relays can filter without parsing
    /// content.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEnvelope`] if serialization or
    /// signing fails.
    pub fn seal(&self, keys: &Keys) -> Result<Event> {
        let content = serde_json::to_string(self)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        let tags = vec![
            Tag::custom(TagKind::custom("t"), [self.session.clone()]),
            Tag::custom(TagKind::custom("type"), [self.payload.type_str().to_string()]),
            Tag::custom(TagKind::custom("role"), [self.from.as_str().to_string()]),
        ];
        EventBuilder::new(Kind::from(HANDSHAKE_KIND), content, tags)
            .to_event(keys)
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("sign: {e}")))
    }

    /// Verify and parse a relay event into an envelope.
    ///
    /// Returns `Ok(None)` when the event belongs to a different bootstrap
    /// session (callers subscribed to a shared relay see foreign traffic).
    ///
    /// # Errors
    ///
    /// Returns an error for wrong kinds, invalid signatures, or content
    /// that does not parse as an envelope.
    pub fn open(event: &Event, session: &str) -> Result<Option<HandshakeEnvelope>> {
        if event.kind != Kind::from(HANDSHAKE_KIND) {
            return Err(ProtocolError::UnexpectedKind(event.kind.as_u16()));
        }
        event
            .verify()
            .map_err(|e| ProtocolError::EventVerification(e.to_string()))?;
        let envelope: HandshakeEnvelope = serde_json::from_str(&event.content)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        if envelope.session != session {
            return Ok(None);
        }
        Ok(Some(envelope))
    }
}

/// Relay subscription filter for one bootstrap session, in the relay's
/// JSON filter dialect (`{kinds, "#t", limit}`).
pub fn subscription_filter(session: &str) -> serde_json::Value {
    json!({
        "kinds": [HANDSHAKE_KIND],
        "#t": [session],
        "limit": 50,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> Keys {
        let secret = nostr::SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000003",
        )
        .expect("secret");
        Keys::new(secret)
    }

    #[test]
    fn envelope_roundtrip_through_signed_event() {
        let keys = test_keys();
        let envelope = HandshakeEnvelope {
            session: "abc123".to_string(),
            from: BootstrapRole::Invitee,
            created_at: 1_700_000_000,
            payload: HandshakePayload::KeyPackage {
                event: "{\"kind\":443}".to_string(),
                bundle: Some("AAAA".to_string()),
                pubkey: Some("deadbeef".to_string()),
            },
        };

        let event = envelope.seal(&keys).expect("seal");
        let opened = HandshakeEnvelope::open(&event, "abc123").expect("open");
        assert_eq!(opened, Some(envelope));
    }

    #[test]
    fn foreign_session_is_filtered_not_rejected() {
        let keys = test_keys();
        let envelope = HandshakeEnvelope {
            session: "session-a".to_string(),
            from: BootstrapRole::Creator,
            created_at: 1,
            payload: HandshakePayload::RequestKeyPackage { pubkey: None },
        };
        let event = envelope.seal(&keys).expect("seal");
        assert_eq!(HandshakeEnvelope::open(&event, "session-b").expect("open"), None);
    }

    #[test]
    fn tampered_content_fails_verification() {
        let keys = test_keys();
        let envelope = HandshakeEnvelope {
            session: "s".to_string(),
            from: BootstrapRole::Creator,
            created_at: 1,
            payload: HandshakePayload::RequestWelcome { pubkey: None },
        };
        let mut event_json: serde_json::Value =
            serde_json::from_str(&envelope.seal(&keys).expect("seal").as_json()).expect("json");
        event_json["content"] = serde_json::Value::String("{\"forged\":true}".to_string());
        let forged = Event::from_json(event_json.to_string()).expect("event parse");

        assert!(matches!(
            HandshakeEnvelope::open(&forged, "s"),
            Err(ProtocolError::EventVerification(_))
        ));
    }

    #[test]
    fn wire_type_tags_are_kebab_case() {
        let envelope = HandshakeEnvelope {
            session: "s".to_string(),
            from: BootstrapRole::Invitee,
            created_at: 7,
            payload: HandshakePayload::RequestWelcome { pubkey: None },
        };
        let value = serde_json::to_value(&envelope).expect("value");
        assert_eq!(value["type"], "request-welcome");
        assert_eq!(value["from"], "invitee");
        assert_eq!(value["session"], "s");
    }

    #[test]
    fn subscription_filter_targets_session_tag() {
        let filter = subscription_filter("chan");
        assert_eq!(filter["kinds"][0], HANDSHAKE_KIND);
        assert_eq!(filter["#t"][0], "chan");
    }
}
