//! Marmot protocol wire types
//!
//! This crate contains the wire-level vocabulary shared by the engine and
//! its drivers. Nothing here performs I/O or holds MLS state:
//!
//! - [`envelope`]: signed handshake envelopes for the signalling relay
//! - [`paths`]: group root and MoQ track path layout
//! - [`frame`]: media wire frames (counter + AEAD ciphertext)
//! - [`payload`]: CBOR application payloads carried inside MLS wrappers
//! - [`auth`]: MoQ relay authorization (bearer tokens and self-issued
//!   capabilities)
//! - [`errors`]: structured protocol errors
//!
//! All decode paths validate sizes and formats before interpreting bytes;
//! authenticity of envelope contents is established by Schnorr signature
//! verification, and authenticity of media frames by the AEAD tag checked
//! in the engine.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod paths;
pub mod payload;

pub use envelope::{
    BootstrapRole, HandshakeEnvelope, HandshakePayload, HANDSHAKE_KIND,
};
pub use errors::{ProtocolError, Result};
pub use frame::MediaFrame;
pub use paths::{GroupRoot, TrackPath};
pub use payload::{AdminUpdate, AppContent, AppPayload, TrackAnnounce, TrackDirectory};
