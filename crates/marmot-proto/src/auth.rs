//! MoQ relay authorization.
//!
//! The relay authorizes publish/subscribe per path. Two schemes are
//! supported, both carried as URL query parameters:
//!
//! - a centrally issued bearer token, passed through opaquely, or
//! - a self-issued capability: a JSON claims object signed with the
//!   member's identity key and base64url-encoded.
//!
//! Capability claims:
//!
//! ```text
//! { ver: 1, kid, root, get: [..], put: [..], exp, nbf?, aud?, jti? }
//! ```
//!
//! `kid` is the issuer's x-only pubkey and must match the signing key.
//! `get`/`put` are path suffixes relative to `root`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Reserved relay event kind wrapping capability claims.
pub const CAPABILITY_KIND: u16 = 44502;

/// Current capability format version.
pub const CAPABILITY_VERSION: u8 = 1;

/// Self-issued capability claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Format version, currently 1
    pub ver: u8,
    /// Issuer key id (x-only pubkey hex); must match the signature
    pub kid: String,
    /// Group root the grants are relative to
    pub root: String,
    /// Readable path suffixes
    pub get: Vec<String>,
    /// Writable path suffixes
    pub put: Vec<String>,
    /// Expiry (unix seconds, exclusive)
    pub exp: u64,
    /// Not-before (unix seconds, inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Intended audience (relay identifier)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Token id for revocation lists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl CapabilityClaims {
    /// Sign these claims into a compact capability token.
    ///
    /// The token is the base64url encoding of a signed event whose content
    /// is the claims JSON; the event signature is the accompanying Schnorr
    /// signature.
    ///
    /// # Errors
    ///
    /// Fails if `kid` does not match the signing key, or on
    /// serialization/signing errors.
    pub fn issue(&self, keys: &Keys) -> Result<String> {
        if self.kid != keys.public_key().to_hex() {
            return Err(ProtocolError::InvalidCapability(
                "kid does not match signing key".to_string(),
            ));
        }
        let content = serde_json::to_string(self)
            .map_err(|e| ProtocolError::InvalidCapability(e.to_string()))?;
        let event = EventBuilder::new(Kind::from(CAPABILITY_KIND), content, Vec::new())
            .to_event(keys)
            .map_err(|e| ProtocolError::InvalidCapability(format!("sign: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(event.as_json()))
    }

    /// Verify a capability token and return its claims.
    ///
    /// Checks the Schnorr signature, the `kid` binding, the format
    /// version, and the `exp`/`nbf` window against `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidCapability`] for malformed or
    /// mis-signed tokens and [`ProtocolError::CapabilityExpired`] when the
    /// window check fails.
    pub fn verify(token: &str, now: u64) -> Result<CapabilityClaims> {
        let event_json = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ProtocolError::InvalidCapability(format!("base64: {e}")))?;
        let event = Event::from_json(&event_json)
            .map_err(|e| ProtocolError::InvalidCapability(format!("event: {e}")))?;
        if event.kind != Kind::from(CAPABILITY_KIND) {
            return Err(ProtocolError::UnexpectedKind(event.kind.as_u16()));
        }
        event
            .verify()
            .map_err(|e| ProtocolError::EventVerification(e.to_string()))?;
        let claims: CapabilityClaims = serde_json::from_str(&event.content)
            .map_err(|e| ProtocolError::InvalidCapability(format!("claims: {e}")))?;
        if claims.ver != CAPABILITY_VERSION {
            return Err(ProtocolError::InvalidCapability(format!(
                "unsupported version {}",
                claims.ver
            )));
        }
        if claims.kid != event.pubkey.to_hex() {
            return Err(ProtocolError::InvalidCapability(
                "kid does not match event signer".to_string(),
            ));
        }
        if now >= claims.exp || claims.nbf.is_some_and(|nbf| now < nbf) {
            return Err(ProtocolError::CapabilityExpired { now });
        }
        Ok(claims)
    }

    /// Whether this capability permits subscribing to `path`.
    pub fn allows_get(&self, path: &str) -> bool {
        Self::grant_matches(&self.root, &self.get, path)
    }

    /// Whether this capability permits publishing to `path`.
    pub fn allows_put(&self, path: &str) -> bool {
        Self::grant_matches(&self.root, &self.put, path)
    }

    fn grant_matches(root: &str, grants: &[String], path: &str) -> bool {
        let Some(suffix) = path.strip_prefix(root).and_then(|r| r.strip_prefix('/')) else {
            return false;
        };
        grants.iter().any(|grant| {
            if let Some(prefix) = grant.strip_suffix("/*") {
                suffix.starts_with(prefix) && suffix.len() > prefix.len()
            } else if grant == "*" {
                true
            } else {
                grant == suffix
            }
        })
    }
}

/// Authorization material for a MoQ connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoqAuth {
    /// Centrally issued opaque bearer token
    Bearer(String),
    /// Self-issued capability token (see [`CapabilityClaims::issue`])
    Capability(String),
}

impl MoqAuth {
    /// Query parameter `(key, value)` carrying this authorization.
    pub fn to_query_pair(&self) -> (&'static str, &str) {
        match self {
            MoqAuth::Bearer(token) => ("token", token),
            MoqAuth::Capability(token) => ("cap", token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        let secret = nostr::SecretKey::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000007",
        )
        .expect("secret");
        Keys::new(secret)
    }

    fn claims(keys: &Keys) -> CapabilityClaims {
        CapabilityClaims {
            ver: CAPABILITY_VERSION,
            kid: keys.public_key().to_hex(),
            root: format!("marmot/{}", "ab".repeat(16)),
            get: vec!["*".to_string()],
            put: vec![format!("wrappers/{}", keys.public_key().to_hex())],
            exp: 2_000_000_000,
            nbf: None,
            aud: None,
            jti: None,
        }
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let keys = keys();
        let claims = claims(&keys);
        let token = claims.issue(&keys).expect("issue");
        let verified = CapabilityClaims::verify(&token, 1_900_000_000).expect("verify");
        assert_eq!(verified, claims);
    }

    #[test]
    fn expired_and_premature_tokens_rejected() {
        let keys = keys();
        let mut c = claims(&keys);
        c.nbf = Some(1_500_000_000);
        let token = c.issue(&keys).expect("issue");

        assert!(matches!(
            CapabilityClaims::verify(&token, 2_000_000_000),
            Err(ProtocolError::CapabilityExpired { .. })
        ));
        assert!(matches!(
            CapabilityClaims::verify(&token, 1_400_000_000),
            Err(ProtocolError::CapabilityExpired { .. })
        ));
    }

    #[test]
    fn kid_must_match_signer() {
        let keys = keys();
        let other = Keys::generate();
        let mut c = claims(&keys);
        c.kid = other.public_key().to_hex();
        assert!(c.issue(&keys).is_err());
    }

    #[test]
    fn path_grants_are_root_relative() {
        let keys = keys();
        let c = claims(&keys);
        let own_wrappers = format!("{}/wrappers/{}", c.root, keys.public_key().to_hex());

        assert!(c.allows_put(&own_wrappers));
        assert!(!c.allows_put(&format!("{}/wrappers/{}", c.root, "cc".repeat(32))));
        assert!(c.allows_get(&format!("{}/audio/{}/mic", c.root, "cc".repeat(32))));
        assert!(!c.allows_get("beaver/ffff/wrappers/aa"));
    }

    #[test]
    fn bearer_token_query_pair() {
        let auth = MoqAuth::Bearer("opaque".to_string());
        assert_eq!(auth.to_query_pair(), ("token", "opaque"));
    }
}
