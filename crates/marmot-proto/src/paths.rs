//! Group root and MoQ track path layout.
//!
//! All tracks of a group live under a stable root derived from the MLS
//! exporter: `marmot/<hex>`. The root is identical for every member and
//! does not change across epochs. Under it:
//!
//! ```text
//! marmot/<hex>/wrappers/<pubkey>          text/control track, single writer
//! marmot/<hex>/audio/<pubkey>/<label>     audio track, single writer
//! ```
//!
//! Path elements are validated on construction: pubkeys must be lowercase
//! hex, labels must be URL-safe. Parsing is strict so a malicious relay
//! cannot smuggle traffic into a foreign namespace.

use std::fmt;

use crate::errors::{ProtocolError, Result};

/// Namespace prefix for every group root.
pub const ROOT_PREFIX: &str = "marmot";

/// Exporter output length used to derive the root.
pub const ROOT_SECRET_LEN: usize = 16;

/// Stable transport namespace of one group: `marmot/<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupRoot(String);

impl GroupRoot {
    /// Build a root from the 16-byte exporter secret.
    pub fn from_exporter_secret(secret: &[u8]) -> GroupRoot {
        GroupRoot(format!("{}/{}", ROOT_PREFIX, hex::encode(secret)))
    }

    /// Parse and validate a root string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPath`] unless the input is exactly
    /// `marmot/<lowercase hex>`.
    pub fn parse(input: &str) -> Result<GroupRoot> {
        let rest = input
            .strip_prefix(ROOT_PREFIX)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| ProtocolError::InvalidPath(format!("missing {ROOT_PREFIX}/ prefix")))?;
        if rest.is_empty() || rest.contains('/') || !is_lower_hex(rest) {
            return Err(ProtocolError::InvalidPath(format!("bad root element: {rest:?}")));
        }
        Ok(GroupRoot(input.to_string()))
    }

    /// The root as a path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully-qualified track path under a group root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackPath {
    /// Text/control track carrying MLS wrapper bytes
    Wrappers {
        /// Group namespace
        root: GroupRoot,
        /// Owning member (single writer)
        pubkey: String,
    },
    /// Audio track carrying encrypted media frames
    Audio {
        /// Group namespace
        root: GroupRoot,
        /// Owning member (single writer)
        pubkey: String,
        /// Track label announced in the encrypted directory
        label: String,
    },
}

impl TrackPath {
    /// Path of a member's wrappers track.
    ///
    /// # Errors
    ///
    /// Rejects pubkeys that are not lowercase hex.
    pub fn wrappers(root: GroupRoot, pubkey: &str) -> Result<TrackPath> {
        validate_pubkey(pubkey)?;
        Ok(TrackPath::Wrappers { root, pubkey: pubkey.to_string() })
    }

    /// Path of a member's audio track.
    ///
    /// # Errors
    ///
    /// Rejects invalid pubkeys and labels with characters outside
    /// `[A-Za-z0-9._-]`.
    pub fn audio(root: GroupRoot, pubkey: &str, label: &str) -> Result<TrackPath> {
        validate_pubkey(pubkey)?;
        validate_label(label)?;
        Ok(TrackPath::Audio {
            root,
            pubkey: pubkey.to_string(),
            label: label.to_string(),
        })
    }

    /// Parse a path string back into its structured form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPath`] for anything that is not one
    /// of the two supported layouts.
    pub fn parse(input: &str) -> Result<TrackPath> {
        let parts: Vec<&str> = input.split('/').collect();
        match parts.as_slice() {
            [prefix, root_hex, "wrappers", pubkey] => {
                let root = GroupRoot::parse(&format!("{prefix}/{root_hex}"))?;
                TrackPath::wrappers(root, pubkey)
            }
            [prefix, root_hex, "audio", pubkey, label] => {
                let root = GroupRoot::parse(&format!("{prefix}/{root_hex}"))?;
                TrackPath::audio(root, pubkey, label)
            }
            _ => Err(ProtocolError::InvalidPath(format!("unrecognized layout: {input:?}"))),
        }
    }

    /// The group root this track belongs to.
    pub fn root(&self) -> &GroupRoot {
        match self {
            TrackPath::Wrappers { root, .. } | TrackPath::Audio { root, .. } => root,
        }
    }

    /// The single writer of this track.
    pub fn owner(&self) -> &str {
        match self {
            TrackPath::Wrappers { pubkey, .. } | TrackPath::Audio { pubkey, .. } => pubkey,
        }
    }
}

impl fmt::Display for TrackPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackPath::Wrappers { root, pubkey } => write!(f, "{root}/wrappers/{pubkey}"),
            TrackPath::Audio { root, pubkey, label } => {
                write!(f, "{root}/audio/{pubkey}/{label}")
            }
        }
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn validate_pubkey(pubkey: &str) -> Result<()> {
    if pubkey.len() != 64 || !is_lower_hex(pubkey) {
        return Err(ProtocolError::InvalidPathElement {
            element: "pubkey",
            reason: "expected 64 lowercase hex characters".to_string(),
        });
    }
    Ok(())
}

fn validate_label(label: &str) -> Result<()> {
    let ok = !label.is_empty()
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    if !ok {
        return Err(ProtocolError::InvalidPathElement {
            element: "label",
            reason: format!("forbidden characters in {label:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PK: &str = "a871b10b48c32c17d18b63e0a10cbd2ec5a76b9d33ee38cdb3abbcbbc9e0cd51";

    #[test]
    fn root_is_stable_prefix_plus_hex() {
        let root = GroupRoot::from_exporter_secret(&[0xab; ROOT_SECRET_LEN]);
        assert_eq!(root.as_str(), format!("marmot/{}", "ab".repeat(16)));
        assert_eq!(GroupRoot::parse(root.as_str()).expect("parse"), root);
    }

    #[test]
    fn root_rejects_foreign_prefix_and_uppercase() {
        assert!(GroupRoot::parse("beaver/abcd").is_err());
        assert!(GroupRoot::parse("marmot/ABCD").is_err());
        assert!(GroupRoot::parse("marmot/").is_err());
        assert!(GroupRoot::parse("marmot/ab/cd").is_err());
    }

    #[test]
    fn track_paths_roundtrip() {
        let root = GroupRoot::from_exporter_secret(&[1; ROOT_SECRET_LEN]);
        let wrappers = TrackPath::wrappers(root.clone(), PK).expect("wrappers");
        let audio = TrackPath::audio(root, PK, "mic-0").expect("audio");

        assert_eq!(TrackPath::parse(&wrappers.to_string()).expect("parse"), wrappers);
        assert_eq!(TrackPath::parse(&audio.to_string()).expect("parse"), audio);
        assert_eq!(wrappers.owner(), PK);
    }

    #[test]
    fn invalid_elements_rejected() {
        let root = GroupRoot::from_exporter_secret(&[1; ROOT_SECRET_LEN]);
        assert!(TrackPath::wrappers(root.clone(), "shorthex").is_err());
        assert!(TrackPath::audio(root.clone(), PK, "bad/label").is_err());
        assert!(TrackPath::audio(root, PK, "").is_err());
        assert!(TrackPath::parse("marmot/aa/video/whatever").is_err());
    }
}
