//! Media key schedule and AEAD framing.
//!
//! Every audio track gets its own key hierarchy, rooted in the MLS
//! exporter so media keys rotate with the group's epoch:
//!
//! ```text
//! base      = MLS-Exporter("moq-media-base-v1",
//!                          sender ‖ track ‖ u64_be(epoch), 32)
//! K_g       = HKDF-Expand(base, "k" ‖ g, 16)      AES-128-GCM key
//! N_salt_g  = HKDF-Expand(base, "n" ‖ g, 12)      per-generation salt
//! ```
//!
//! The generation `g` is the high byte of the 32-bit frame counter; the
//! 96-bit nonce is the salt with its last four bytes XORed by the
//! big-endian counter. `(sender, track, epoch, counter)` is unique by
//! construction, and [`SenderCounter`] makes counter reuse impossible on
//! the encrypt side.
//!
//! Keys for recent generations and the previous epoch are retained for a
//! short window to absorb reorder across generation and commit
//! boundaries.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::env::Environment;

/// How long superseded generation/epoch keys stay decryptable.
pub const KEY_RETENTION: Duration = Duration::from_secs(10);

/// AAD format version byte.
pub const AAD_VERSION: u8 = 1;

/// Media crypto failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// AEAD seal failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// AEAD open failed (bad key, nonce, tag, or AAD)
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// The 32-bit counter space for this (track, epoch) is spent
    #[error("frame counter exhausted")]
    CounterExhausted,

    /// No retained key material can open this frame
    #[error("no usable epoch key (frame under an expired epoch?)")]
    StaleEpoch,
}

struct CachedGeneration<I> {
    aead_key: [u8; 16],
    nonce_salt: [u8; 12],
    derived_at: I,
}

/// Per-(sender, track, epoch) AEAD engine.
pub struct MediaCrypto<E: Environment> {
    env: E,
    base_key: [u8; 32],
    cache: HashMap<u8, CachedGeneration<E::Instant>>,
    retention: Duration,
}

impl<E: Environment> MediaCrypto<E> {
    /// Wrap a base key from the MLS exporter.
    pub fn new(env: E, base_key: [u8; 32]) -> Self {
        Self { env, base_key, cache: HashMap::new(), retention: KEY_RETENTION }
    }

    /// Encrypt one frame. The counter's high byte selects the key
    /// generation.
    ///
    /// # Errors
    ///
    /// Fails on KDF or AEAD errors.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        frame_counter: u32,
        aad: &[u8],
    ) -> Result<Vec<u8>, MediaError> {
        let generation = (frame_counter >> 24) as u8;
        let (aead_key, nonce_salt) = self.generation_keys(generation)?;
        let nonce_bytes = construct_nonce(&nonce_salt, frame_counter);

        let cipher = Aes128Gcm::new(&aead_key.into());
        cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|e| MediaError::Encrypt(e.to_string()))
    }

    /// Decrypt one frame. Position-agnostic beyond what the AAD binds.
    ///
    /// # Errors
    ///
    /// Fails if the tag does not verify (wrong counter, AAD, or key).
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        frame_counter: u32,
        aad: &[u8],
    ) -> Result<Vec<u8>, MediaError> {
        let generation = (frame_counter >> 24) as u8;
        let (aead_key, nonce_salt) = self.generation_keys(generation)?;
        let nonce_bytes = construct_nonce(&nonce_salt, frame_counter);

        let cipher = Aes128Gcm::new(&aead_key.into());
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: ciphertext, aad })
            .map_err(|e| MediaError::Decrypt(e.to_string()))
    }

    /// Derive (or fetch cached) keys for a generation, evicting entries
    /// older than the retention window.
    fn generation_keys(&mut self, generation: u8) -> Result<([u8; 16], [u8; 12]), MediaError> {
        let now = self.env.now();
        let retention = self.retention;
        self.cache.retain(|_, cached| now - cached.derived_at < retention);

        if !self.cache.contains_key(&generation) {
            let hkdf = Hkdf::<Sha256>::new(None, &self.base_key);

            let mut aead_key = [0u8; 16];
            hkdf.expand(&[b'k', generation], &mut aead_key)
                .map_err(|e| MediaError::Kdf(format!("key: {e}")))?;

            let mut nonce_salt = [0u8; 12];
            hkdf.expand(&[b'n', generation], &mut nonce_salt)
                .map_err(|e| MediaError::Kdf(format!("salt: {e}")))?;

            self.cache
                .insert(generation, CachedGeneration { aead_key, nonce_salt, derived_at: now });
        }

        let cached = self.cache.get(&generation).ok_or(MediaError::StaleEpoch)?;
        Ok((cached.aead_key, cached.nonce_salt))
    }

    #[cfg(test)]
    fn cached_generations(&self) -> usize {
        self.cache.len()
    }
}

/// Nonce = salt with its last four bytes XORed by the big-endian counter.
///
/// The generation byte participates in the XOR; it is constant within a
/// generation, so nonce uniqueness per (key, counter) still holds.
fn construct_nonce(nonce_salt: &[u8; 12], frame_counter: u32) -> [u8; 12] {
    let mut nonce = *nonce_salt;
    for (i, byte) in frame_counter.to_be_bytes().iter().enumerate() {
        nonce[8 + i] ^= byte;
    }
    nonce
}

/// Monotonic counter issuance for one (track, epoch) on the encrypt side.
///
/// Counters are handed out exactly once; a spent counter can never be
/// issued again, which structurally prevents nonce reuse.
#[derive(Debug, Default, Clone)]
pub struct SenderCounter {
    next: u32,
    exhausted: bool,
}

impl SenderCounter {
    /// Counter source starting at zero (generation 0, keyframe first).
    pub fn new() -> SenderCounter {
        SenderCounter::default()
    }

    /// Issue the next counter.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::CounterExhausted`] once all 2³² counters are
    /// spent; callers must rotate the epoch.
    pub fn issue(&mut self) -> Result<u32, MediaError> {
        if self.exhausted {
            return Err(MediaError::CounterExhausted);
        }
        let counter = self.next;
        match self.next.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok(counter)
    }

    /// How many counters were issued so far.
    pub fn issued(&self) -> u64 {
        if self.exhausted {
            u64::from(u32::MAX) + 1
        } else {
            u64::from(self.next)
        }
    }
}

/// AAD builder binding a frame to its group, track, and position.
///
/// Big-endian concatenation of
/// `version ‖ group_root ‖ track_label ‖ epoch ‖ group_seq ‖ frame_idx ‖
/// keyframe`.
#[derive(Debug, Default)]
pub struct AadBuilder {
    parts: Vec<Vec<u8>>,
}

impl AadBuilder {
    /// Empty builder.
    pub fn new() -> AadBuilder {
        AadBuilder::default()
    }

    /// Format version byte (currently [`AAD_VERSION`]).
    #[must_use]
    pub fn version(mut self, version: u8) -> Self {
        self.parts.push(vec![version]);
        self
    }

    /// Group root string (`marmot/<hex>`).
    #[must_use]
    pub fn group_root(mut self, root: &str) -> Self {
        self.parts.push(root.as_bytes().to_vec());
        self
    }

    /// Track label.
    #[must_use]
    pub fn track_label(mut self, label: &str) -> Self {
        self.parts.push(label.as_bytes().to_vec());
        self
    }

    /// MLS epoch the frame was sealed under.
    #[must_use]
    pub fn epoch(mut self, epoch: u64) -> Self {
        self.parts.push(epoch.to_be_bytes().to_vec());
        self
    }

    /// MoQ group paging index.
    #[must_use]
    pub fn group_sequence(mut self, seq: u64) -> Self {
        self.parts.push(seq.to_be_bytes().to_vec());
        self
    }

    /// Frame index within the MoQ group.
    #[must_use]
    pub fn frame_index(mut self, idx: u64) -> Self {
        self.parts.push(idx.to_be_bytes().to_vec());
        self
    }

    /// Keyframe marker (`1` when the frame opens its generation).
    #[must_use]
    pub fn keyframe(mut self, is_keyframe: bool) -> Self {
        self.parts.push(vec![u8::from(is_keyframe)]);
        self
    }

    /// Concatenate into the final AAD bytes.
    pub fn build(self) -> Vec<u8> {
        self.parts.concat()
    }
}

/// Receive-side key management across epoch rotations.
///
/// Holds the current epoch's [`MediaCrypto`] plus superseded epochs for
/// [`KEY_RETENTION`], so frames sealed just before a commit still open
/// after it. Expired epochs are purged and their frames rejected.
pub struct MediaKeyring<E: Environment> {
    env: E,
    epochs: BTreeMap<u64, EpochEntry<E>>,
    retention: Duration,
}

struct EpochEntry<E: Environment> {
    crypto: MediaCrypto<E>,
    superseded_at: Option<E::Instant>,
}

impl<E: Environment> MediaKeyring<E> {
    /// Empty keyring.
    pub fn new(env: E) -> Self {
        Self { env, epochs: BTreeMap::new(), retention: KEY_RETENTION }
    }

    /// Install the base key for a new epoch, superseding all older ones.
    pub fn install(&mut self, epoch: u64, base_key: [u8; 32]) {
        let now = self.env.now();
        for entry in self.epochs.values_mut() {
            entry.superseded_at.get_or_insert(now);
        }
        self.epochs.insert(
            epoch,
            EpochEntry { crypto: MediaCrypto::new(self.env.clone(), base_key), superseded_at: None },
        );
    }

    /// Decrypt a frame, trying the newest epoch first. `aad_for_epoch`
    /// rebuilds the AAD for each candidate epoch, since the epoch is part
    /// of the bound data.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::StaleEpoch`] when no retained epoch opens
    /// the frame.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        frame_counter: u32,
        mut aad_for_epoch: impl FnMut(u64) -> Vec<u8>,
    ) -> Result<(u64, Vec<u8>), MediaError> {
        let now = self.env.now();
        let retention = self.retention;
        self.epochs.retain(|_, entry| match entry.superseded_at {
            Some(at) => now - at < retention,
            None => true,
        });

        let epochs: Vec<u64> = self.epochs.keys().rev().copied().collect();
        for epoch in epochs {
            let aad = aad_for_epoch(epoch);
            if let Some(entry) = self.epochs.get_mut(&epoch) {
                if let Ok(plaintext) = entry.crypto.decrypt(ciphertext, frame_counter, &aad) {
                    return Ok((epoch, plaintext));
                }
            }
        }
        Err(MediaError::StaleEpoch)
    }
}
