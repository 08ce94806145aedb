//! Media wire frames.
//!
//! A media frame on the wire is the 32-bit big-endian frame counter
//! followed by the AEAD ciphertext (which includes the 16-byte tag):
//!
//! ```text
//! [counter: u32 BE][ciphertext + tag: variable]
//! ```
//!
//! The counter is authenticated implicitly: it selects the nonce, so a
//! modified counter makes the AEAD open fail. The high byte of the
//! counter is the key generation.
//!
//! # Invariants
//!
//! - A decoded frame always carries at least one AEAD tag worth of
//!   ciphertext; shorter inputs are rejected before any crypto runs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Minimum size of an encoded media frame (counter + empty-plaintext tag).
pub const MIN_FRAME_LEN: usize = 4 + TAG_LEN;

/// One encrypted media frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// 32-bit frame counter; the high byte is the key generation
    pub counter: u32,
    /// AEAD ciphertext including the tag
    pub ciphertext: Bytes,
}

impl MediaFrame {
    /// Assemble a frame from its parts.
    pub fn new(counter: u32, ciphertext: impl Into<Bytes>) -> MediaFrame {
        MediaFrame { counter, ciphertext: ciphertext.into() }
    }

    /// Key generation selected by this frame's counter.
    pub fn generation(&self) -> u8 {
        (self.counter >> 24) as u8
    }

    /// Intra-generation counter (low 24 bits).
    pub fn intra_counter(&self) -> u32 {
        self.counter & 0x00FF_FFFF
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.ciphertext.len());
        buf.put_u32(self.counter);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooShort`] if the input cannot hold a
    /// counter and an AEAD tag.
    pub fn decode(bytes: &[u8]) -> Result<MediaFrame> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: MIN_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        let counter = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(MediaFrame {
            counter,
            ciphertext: Bytes::copy_from_slice(&bytes[4..]),
        })
    }
}
