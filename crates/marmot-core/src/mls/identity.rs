//! The MLS handle: single owner of all MLS cryptographic state.
//!
//! An [`Identity`] binds a long-term secp256k1 identity key to MLS leaf
//! material and owns every group the process participates in. All MLS
//! encrypt/decrypt, commit, and exporter operations go through here; the
//! controller never touches OpenMLS directly.
//!
//! Wrapper bytes on the wire are TLS-serialized MLS messages. Application
//! plaintext is the CBOR [`AppPayload`]; the member's pubkey rides in the
//! leaf's basic credential, so authorship needs no extra framing.

use std::collections::{BTreeSet, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, SecretKey, Tag, TagKind};
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::storage::StorageProvider as _;
use tls_codec::{Deserialize as _, Serialize as _};

use marmot_proto::paths::{GroupRoot, ROOT_SECRET_LEN};
use marmot_proto::AppPayload;

use crate::env::Environment;

use super::error::MlsError;
use super::group::{credential_pubkey, GroupPhase, GroupState, MemberInfo};
use super::provider::MlsProvider;

/// Relay event kind for MLS key package publication (NIP-EE).
const MLS_KEY_PACKAGE_KIND: u16 = 443;

/// Exporter label for the stable transport root.
pub const GROUP_ROOT_LABEL: &str = "moq-group-root-v1";

/// Exporter label for per-sender media base keys.
pub const MEDIA_BASE_LABEL: &str = "moq-media-base-v1";

const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// How many past epochs stay decryptable, absorbing wrappers that cross
/// a commit boundary in flight.
const MAX_PAST_EPOCHS: usize = 3;

/// A signed key-package offer plus its locally re-importable bundle.
#[derive(Debug, Clone)]
pub struct KeyPackageOffer {
    /// Signed relay event (JSON) carrying the serialized key package
    pub event_json: String,
    /// base64(JSON(KeyPackageBundle)) for reinsertion after a restart
    pub bundle_b64: String,
}

/// Result of forming a new group.
#[derive(Debug, Clone)]
pub struct GroupCreation {
    /// Stable group identifier (hex)
    pub group_id_hex: String,
    /// Serialized welcome for the initial invitees (base64)
    pub welcome_b64: String,
    /// Pubkeys the welcome addresses
    pub recipients: Vec<String>,
}

/// A commit wrapper ready to publish.
#[derive(Debug, Clone)]
pub struct CommitDescriptor {
    /// TLS-serialized commit wrapper bytes
    pub commit_bytes: Vec<u8>,
    /// Epoch the group is at once the commit is merged
    pub epoch_after: u64,
}

/// Result of an add-members commit.
#[derive(Debug, Clone)]
pub struct AddMembersArtifacts {
    /// The commit to publish to existing members
    pub commit: CommitDescriptor,
    /// Serialized welcome for the new members (base64)
    pub welcome_b64: String,
    /// Pubkeys the welcome addresses
    pub recipients: Vec<String>,
}

/// Result of merging a pending commit.
#[derive(Debug, Clone, Copy)]
pub struct MergeOutcome {
    /// Epoch after the merge
    pub epoch_after: u64,
    /// True when the merged commit removed the local member
    pub removed_self: bool,
}

/// Outcome of ingesting one inbound wrapper.
#[derive(Debug, Clone)]
pub enum WrapperOutcome {
    /// A decrypted application message
    Application {
        /// Group the message belongs to
        group_id_hex: String,
        /// Sender pubkey, from the authenticated leaf credential
        author: String,
        /// Decrypted payload (text or directory)
        payload: AppPayload,
    },
    /// A remote commit was staged; merge to advance the epoch
    Commit {
        /// Group the commit belongs to
        group_id_hex: String,
        /// Epoch the group will be at after the merge
        epoch_after: u64,
    },
    /// A proposal was stored for a later commit
    Proposal {
        /// Group the proposal belongs to
        group_id_hex: String,
    },
    /// A welcome addressed to this identity arrived on the transport
    Welcome {
        /// Group the welcome admits into
        group_id_hex: String,
    },
    /// The wrapper could not be processed
    Unprocessable {
        /// What went wrong
        reason: String,
        /// Whether a retry after epoch advance may succeed
        transient: bool,
    },
}

/// The engine's identity and MLS state owner.
pub struct Identity<E: Environment> {
    keys: Keys,
    signer: SignatureKeyPair,
    credential: CredentialWithKey,
    provider: MlsProvider<E>,
    env: E,
    groups: HashMap<String, GroupState>,
}

impl<E: Environment> Identity<E> {
    /// Initialize key material from a 32-byte secret (hex). Idempotent
    /// per secret: the same secret always yields the same identity key.
    ///
    /// # Errors
    ///
    /// Returns [`MlsError::InvalidCredential`] for unparsable secrets and
    /// [`MlsError::Crypto`]/[`MlsError::Storage`] if leaf key generation
    /// fails.
    pub fn new(env: E, secret_hex: &str) -> Result<Self, MlsError> {
        let secret = SecretKey::from_hex(secret_hex)
            .map_err(|e| MlsError::InvalidCredential(format!("secret: {e}")))?;
        let keys = Keys::new(secret);
        let provider = MlsProvider::new(env.clone());

        let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
            .map_err(|e| MlsError::Crypto(format!("leaf keypair: {e}")))?;
        signer
            .store(provider.storage())
            .map_err(|e| MlsError::Storage(format!("store leaf keypair: {e:?}")))?;

        let credential = BasicCredential::new(keys.public_key().to_hex().into_bytes());
        let credential_with_key = CredentialWithKey {
            credential: credential.into(),
            signature_key: signer.public().into(),
        };

        Ok(Self {
            keys,
            signer,
            credential: credential_with_key,
            provider,
            env,
            groups: HashMap::new(),
        })
    }

    /// The durable identifier: x-only pubkey, lowercase hex.
    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    /// The identity's signing keys, for relay envelopes and capabilities.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Produce a signed key-package offer plus a re-importable bundle.
    ///
    /// # Errors
    ///
    /// Fails on key generation, serialization, or signing errors.
    pub fn create_key_package(&mut self, relay_hints: &[String]) -> Result<KeyPackageOffer, MlsError> {
        let bundle = KeyPackage::builder()
            .build(CIPHERSUITE, &self.provider, &self.signer, self.credential.clone())
            .map_err(|e| MlsError::Crypto(format!("key package: {e}")))?;

        let kp_bytes = bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("key package: {e}")))?;

        let mut tags = Vec::new();
        if !relay_hints.is_empty() {
            tags.push(Tag::custom(TagKind::custom("relays"), relay_hints.to_vec()));
        }
        let event = EventBuilder::new(Kind::from(MLS_KEY_PACKAGE_KIND), BASE64.encode(&kp_bytes), tags)
            .to_event(&self.keys)
            .map_err(|e| MlsError::Crypto(format!("sign key package event: {e}")))?;

        let bundle_json = serde_json::to_vec(&bundle)
            .map_err(|e| MlsError::Serialization(format!("bundle: {e}")))?;

        Ok(KeyPackageOffer {
            event_json: event.as_json(),
            bundle_b64: BASE64.encode(bundle_json),
        })
    }

    /// Reinsert an exported key-package bundle into provider storage so a
    /// welcome created against the offer can still be accepted.
    ///
    /// # Errors
    ///
    /// Fails if the bundle does not decode or storage rejects it.
    pub fn import_key_package_bundle(&mut self, bundle_b64: &str) -> Result<(), MlsError> {
        let bundle_json = BASE64
            .decode(bundle_b64)
            .map_err(|e| MlsError::Serialization(format!("bundle base64: {e}")))?;
        let bundle: KeyPackageBundle = serde_json::from_slice(&bundle_json)
            .map_err(|e| MlsError::Serialization(format!("bundle json: {e}")))?;
        let hash_ref = bundle
            .key_package()
            .hash_ref(self.provider.crypto())
            .map_err(|e| MlsError::Crypto(format!("hash ref: {e}")))?;
        self.provider
            .storage()
            .write_key_package::<_, KeyPackageBundle>(&hash_ref, &bundle)
            .map_err(|e| MlsError::Storage(format!("write key package: {e:?}")))?;
        Ok(())
    }

    /// Form a new group seeded with the given key-package offers. The
    /// creator is admin; `extra_admins` extends the set.
    ///
    /// # Errors
    ///
    /// Fails if an offer is invalid, does not bind to its signing key, or
    /// group creation fails.
    pub fn create_group(
        &mut self,
        invitee_events: &[String],
        extra_admins: &[String],
    ) -> Result<GroupCreation, MlsError> {
        let mut key_packages = Vec::with_capacity(invitee_events.len());
        let mut recipients = Vec::with_capacity(invitee_events.len());
        for event_json in invitee_events {
            let (kp, pubkey) = self.parse_key_package_event(event_json)?;
            key_packages.push(kp);
            recipients.push(pubkey);
        }

        // 32-byte group id, stable for the life of the group.
        let mut id_bytes = [0u8; 32];
        self.env.random_bytes(&mut id_bytes);
        let group_id = GroupId::from_slice(&id_bytes);

        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .max_past_epochs(MAX_PAST_EPOCHS)
            .build();
        let mut mls_group = MlsGroup::new_with_group_id(
            &self.provider,
            &self.signer,
            &config,
            group_id,
            self.credential.clone(),
        )
        .map_err(|e| MlsError::Crypto(format!("create group: {e}")))?;

        let (_commit, welcome, _group_info) = mls_group
            .add_members(&self.provider, &self.signer, &key_packages)
            .map_err(|e| MlsError::Crypto(format!("add initial members: {e}")))?;
        mls_group
            .merge_pending_commit(&self.provider)
            .map_err(|e| MlsError::Crypto(format!("merge initial commit: {e}")))?;

        let welcome_bytes = welcome
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("welcome: {e}")))?;

        let mut admins: BTreeSet<String> = extra_admins.iter().cloned().collect();
        admins.insert(self.public_key_hex());

        let state = GroupState::new(mls_group, admins);
        let group_id_hex = state.group_id_hex();
        self.groups.insert(group_id_hex.clone(), state);

        Ok(GroupCreation {
            group_id_hex,
            welcome_b64: BASE64.encode(welcome_bytes),
            recipients,
        })
    }

    /// Join a group from a welcome envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MlsError::StaleWelcome`] when the welcome targets a key
    /// package this identity no longer holds or a group epoch already
    /// joined; such failures are transient and restart the handshake.
    pub fn accept_welcome(
        &mut self,
        welcome_b64: &str,
        admins: &BTreeSet<String>,
    ) -> Result<String, MlsError> {
        let welcome_bytes = BASE64
            .decode(welcome_b64)
            .map_err(|e| MlsError::Serialization(format!("welcome base64: {e}")))?;
        let message = MlsMessageIn::tls_deserialize_exact(&welcome_bytes)
            .map_err(|e| MlsError::Serialization(format!("welcome: {e}")))?;
        let welcome = match message.extract() {
            MlsMessageBodyIn::Welcome(welcome) => welcome,
            _ => return Err(MlsError::Serialization("not a welcome message".to_string())),
        };

        let join_config = MlsGroupJoinConfig::builder()
            .max_past_epochs(MAX_PAST_EPOCHS)
            .build();
        let staged = StagedWelcome::new_from_welcome(&self.provider, &join_config, welcome, None)
            .map_err(|e| MlsError::StaleWelcome(e.to_string()))?;
        let mls_group = staged
            .into_group(&self.provider)
            .map_err(|e| MlsError::StaleWelcome(e.to_string()))?;

        let group_id_hex = hex::encode(mls_group.group_id().as_slice());
        if let Some(existing) = self.groups.get(&group_id_hex) {
            if existing.epoch() >= mls_group.epoch().as_u64() {
                return Err(MlsError::StaleWelcome(format!(
                    "already at epoch {} of group {group_id_hex}",
                    existing.epoch()
                )));
            }
        }

        self.groups
            .insert(group_id_hex.clone(), GroupState::new(mls_group, admins.clone()));
        Ok(group_id_hex)
    }

    /// Encrypt an application payload to the group's current epoch.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown, the local member was removed, or
    /// encryption fails.
    pub fn create_message(
        &mut self,
        group_id_hex: &str,
        payload: &AppPayload,
    ) -> Result<Vec<u8>, MlsError> {
        let signer = &self.signer;
        let provider = &self.provider;
        let group = Self::group_mut(&mut self.groups, group_id_hex)?;
        if group.phase == GroupPhase::Removed {
            return Err(MlsError::RemovedFromGroup);
        }
        let plaintext = payload.encode().map_err(|e| MlsError::Codec(e.to_string()))?;
        let message = group
            .mls_group
            .create_message(provider, signer, &plaintext)
            .map_err(|e| MlsError::Crypto(format!("create message: {e}")))?;
        message
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("wrapper: {e}")))
    }

    /// Process one inbound wrapper.
    ///
    /// Remote commits are staged, not merged; the caller observes
    /// [`WrapperOutcome::Commit`] and decides when to call
    /// [`Identity::merge_pending_commit`].
    ///
    /// # Errors
    ///
    /// Only internal invariant violations error out; protocol-level
    /// failures are reported as [`WrapperOutcome::Unprocessable`].
    pub fn ingest_wrapper(&mut self, bytes: &[u8]) -> Result<WrapperOutcome, MlsError> {
        let message = match MlsMessageIn::tls_deserialize_exact(bytes) {
            Ok(message) => message,
            Err(e) => {
                return Ok(WrapperOutcome::Unprocessable {
                    reason: format!("undecodable wrapper: {e}"),
                    transient: false,
                })
            }
        };

        let protocol_message: ProtocolMessage = match message.extract() {
            MlsMessageBodyIn::Welcome(welcome) => return Ok(self.inspect_welcome(welcome)),
            MlsMessageBodyIn::PublicMessage(public) => public.into(),
            MlsMessageBodyIn::PrivateMessage(private) => private.into(),
            _ => {
                return Ok(WrapperOutcome::Unprocessable {
                    reason: "unsupported wrapper body".to_string(),
                    transient: false,
                })
            }
        };

        let group_id_hex = hex::encode(protocol_message.group_id().as_slice());
        let wrapper_epoch = protocol_message.epoch().as_u64();

        let provider = &self.provider;
        let Some(group) = self.groups.get_mut(&group_id_hex) else {
            return Ok(WrapperOutcome::Unprocessable {
                reason: format!("unknown group {group_id_hex}"),
                transient: false,
            });
        };
        if group.phase == GroupPhase::Removed {
            return Err(MlsError::RemovedFromGroup);
        }

        let current_epoch = group.epoch();
        if wrapper_epoch > current_epoch {
            return Ok(WrapperOutcome::Unprocessable {
                reason: MlsError::FutureEpoch { received: wrapper_epoch, current: current_epoch }
                    .to_string(),
                transient: true,
            });
        }

        let processed = match group.mls_group.process_message(provider, protocol_message) {
            Ok(processed) => processed,
            Err(e) => {
                // A wrapper that fails while a merge is outstanding, or
                // that was sealed under an older epoch, can still become
                // processable; everything else is a hard failure.
                let transient = group.has_pending_commit() || wrapper_epoch < current_epoch;
                return Ok(WrapperOutcome::Unprocessable {
                    reason: format!("process wrapper: {e}"),
                    transient,
                });
            }
        };

        let sender = processed.sender().clone();
        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app) => {
                let author = match sender {
                    Sender::Member(index) => group.member_pubkey(index),
                    _ => None,
                };
                let Some(author) = author else {
                    return Ok(WrapperOutcome::Unprocessable {
                        reason: "application message without member sender".to_string(),
                        transient: false,
                    });
                };
                match AppPayload::decode(&app.into_bytes()) {
                    Ok(payload) => Ok(WrapperOutcome::Application { group_id_hex, author, payload }),
                    Err(e) => Ok(WrapperOutcome::Unprocessable {
                        reason: format!("payload: {e}"),
                        transient: false,
                    }),
                }
            }
            ProcessedMessageContent::StagedCommitMessage(staged) => {
                group.stash_commit(staged)?;
                Ok(WrapperOutcome::Commit { group_id_hex, epoch_after: current_epoch + 1 })
            }
            ProcessedMessageContent::ProposalMessage(proposal) => {
                group
                    .mls_group
                    .store_pending_proposal(provider.storage(), *proposal)
                    .map_err(|e| MlsError::Storage(format!("store proposal: {e:?}")))?;
                Ok(WrapperOutcome::Proposal { group_id_hex })
            }
            ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
                Ok(WrapperOutcome::Proposal { group_id_hex })
            }
        }
    }

    /// Merge the staged remote commit, advancing the epoch by one.
    ///
    /// # Errors
    ///
    /// Returns [`MlsError::NoPendingCommit`] when nothing is staged.
    pub fn merge_pending_commit(&mut self, group_id_hex: &str) -> Result<MergeOutcome, MlsError> {
        let provider = &self.provider;
        let group = Self::group_mut(&mut self.groups, group_id_hex)?;
        let staged = group.take_staged_commit().ok_or(MlsError::NoPendingCommit)?;
        let removed_self = staged.self_removed();
        group
            .mls_group
            .merge_staged_commit(provider, *staged)
            .map_err(|e| MlsError::Crypto(format!("merge commit: {e}")))?;
        if removed_self || !group.mls_group.is_active() {
            group.phase = GroupPhase::Removed;
        }
        Ok(MergeOutcome { epoch_after: group.epoch(), removed_self })
    }

    /// Produce and locally merge a key-rotation commit.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown or the commit cannot be built.
    pub fn self_update(&mut self, group_id_hex: &str) -> Result<CommitDescriptor, MlsError> {
        let signer = &self.signer;
        let provider = &self.provider;
        let group = Self::group_mut(&mut self.groups, group_id_hex)?;
        if group.phase == GroupPhase::Removed {
            return Err(MlsError::RemovedFromGroup);
        }
        let bundle = group
            .mls_group
            .self_update(provider, signer, LeafNodeParameters::default())
            .map_err(|e| MlsError::Crypto(format!("self update: {e}")))?;
        let (commit, _welcome, _group_info) = bundle;
        let commit_bytes = commit
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("commit: {e}")))?;
        group
            .mls_group
            .merge_pending_commit(provider)
            .map_err(|e| MlsError::Crypto(format!("merge own commit: {e}")))?;
        Ok(CommitDescriptor { commit_bytes, epoch_after: group.epoch() })
    }

    /// Build, locally merge, and describe an add-members commit.
    ///
    /// # Errors
    ///
    /// Fails for invalid offers or members already present.
    pub fn add_members(
        &mut self,
        group_id_hex: &str,
        key_package_events: &[String],
    ) -> Result<AddMembersArtifacts, MlsError> {
        let mut key_packages = Vec::with_capacity(key_package_events.len());
        let mut recipients = Vec::with_capacity(key_package_events.len());
        for event_json in key_package_events {
            let (kp, pubkey) = self.parse_key_package_event(event_json)?;
            key_packages.push(kp);
            recipients.push(pubkey);
        }

        let signer = &self.signer;
        let provider = &self.provider;
        let group = Self::group_mut(&mut self.groups, group_id_hex)?;
        if group.phase == GroupPhase::Removed {
            return Err(MlsError::RemovedFromGroup);
        }
        for pubkey in &recipients {
            if group.member_index(pubkey).is_some() {
                return Err(MlsError::MemberAlreadyPresent { pubkey: pubkey.clone() });
            }
        }

        let (commit, welcome, _group_info) = group
            .mls_group
            .add_members(provider, signer, &key_packages)
            .map_err(|e| MlsError::Crypto(format!("add members: {e}")))?;
        let commit_bytes = commit
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("commit: {e}")))?;
        let welcome_bytes = welcome
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("welcome: {e}")))?;
        group
            .mls_group
            .merge_pending_commit(provider)
            .map_err(|e| MlsError::Crypto(format!("merge own commit: {e}")))?;

        Ok(AddMembersArtifacts {
            commit: CommitDescriptor { commit_bytes, epoch_after: group.epoch() },
            welcome_b64: BASE64.encode(welcome_bytes),
            recipients,
        })
    }

    /// Build and locally merge a remove-member commit.
    ///
    /// # Errors
    ///
    /// Fails if the member is not in the roster.
    pub fn remove_member(
        &mut self,
        group_id_hex: &str,
        pubkey: &str,
    ) -> Result<CommitDescriptor, MlsError> {
        let signer = &self.signer;
        let provider = &self.provider;
        let group = Self::group_mut(&mut self.groups, group_id_hex)?;
        let index = group
            .member_index(pubkey)
            .ok_or_else(|| MlsError::MemberNotFound { pubkey: pubkey.to_string() })?;
        let (commit, _welcome, _group_info) = group
            .mls_group
            .remove_members(provider, signer, &[index])
            .map_err(|e| MlsError::Crypto(format!("remove member: {e}")))?;
        let commit_bytes = commit
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("commit: {e}")))?;
        group
            .mls_group
            .merge_pending_commit(provider)
            .map_err(|e| MlsError::Crypto(format!("merge own commit: {e}")))?;
        group.set_admin(pubkey, false);
        Ok(CommitDescriptor { commit_bytes, epoch_after: group.epoch() })
    }

    /// Authoritative roster with admin flags.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown.
    pub fn list_members(&self, group_id_hex: &str) -> Result<Vec<MemberInfo>, MlsError> {
        Ok(self.group(group_id_hex)?.members())
    }

    /// Grant or revoke admin rights. Callers pair this with the commit
    /// that motivated the change.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown.
    pub fn set_admin(&mut self, group_id_hex: &str, pubkey: &str, is_admin: bool) -> Result<(), MlsError> {
        Self::group_mut(&mut self.groups, group_id_hex)?.set_admin(pubkey, is_admin);
        Ok(())
    }

    /// Replace the whole admin set, as carried by an admin update from a
    /// current admin.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown.
    pub fn set_admins(&mut self, group_id_hex: &str, admins: BTreeSet<String>) -> Result<(), MlsError> {
        Self::group_mut(&mut self.groups, group_id_hex)?.set_admins(admins);
        Ok(())
    }

    /// The current admin set.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown.
    pub fn admin_set(&self, group_id_hex: &str) -> Result<BTreeSet<String>, MlsError> {
        Ok(self.group(group_id_hex)?.admins.clone())
    }

    /// Whether the given member is an admin of the group.
    pub fn is_admin(&self, group_id_hex: &str, pubkey: &str) -> bool {
        self.groups
            .get(group_id_hex)
            .is_some_and(|group| group.admins.contains(pubkey))
    }

    /// Current epoch of the group.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown.
    pub fn current_epoch(&self, group_id_hex: &str) -> Result<u64, MlsError> {
        Ok(self.group(group_id_hex)?.epoch())
    }

    /// Lifecycle phase of the group.
    pub fn group_phase(&self, group_id_hex: &str) -> Option<GroupPhase> {
        self.groups.get(group_id_hex).map(|group| group.phase)
    }

    /// MLS exporter for the group's current epoch.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown or the exporter fails.
    pub fn export_secret(
        &self,
        group_id_hex: &str,
        label: &str,
        context: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, MlsError> {
        let group = self.group(group_id_hex)?;
        group
            .mls_group
            .export_secret(&self.provider, label, context, length)
            .map_err(|e| MlsError::Crypto(format!("exporter: {e}")))
    }

    /// Derive the stable transport root `marmot/<hex>`.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown or the exporter fails.
    pub fn derive_group_root(&self, group_id_hex: &str) -> Result<GroupRoot, MlsError> {
        let group_id = hex::decode(group_id_hex)
            .map_err(|e| MlsError::Serialization(format!("group id: {e}")))?;
        let secret = self.export_secret(group_id_hex, GROUP_ROOT_LABEL, &group_id, ROOT_SECRET_LEN)?;
        Ok(GroupRoot::from_exporter_secret(&secret))
    }

    /// Derive the media base key for `(sender, track, current epoch)`.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown or the exporter fails.
    pub fn derive_media_base_key(
        &self,
        group_id_hex: &str,
        sender_pubkey: &str,
        track_label: &str,
    ) -> Result<[u8; 32], MlsError> {
        let epoch = self.current_epoch(group_id_hex)?;
        let mut context = Vec::with_capacity(sender_pubkey.len() + track_label.len() + 8);
        context.extend_from_slice(sender_pubkey.as_bytes());
        context.extend_from_slice(track_label.as_bytes());
        context.extend_from_slice(&epoch.to_be_bytes());
        let secret = self.export_secret(group_id_hex, MEDIA_BASE_LABEL, &context, 32)?;
        let mut base = [0u8; 32];
        base.copy_from_slice(&secret);
        Ok(base)
    }

    /// Verify and parse a key-package offer event, checking that the MLS
    /// credential binds to the event's signing key.
    fn parse_key_package_event(&self, event_json: &str) -> Result<(KeyPackage, String), MlsError> {
        let event = Event::from_json(event_json)
            .map_err(|e| MlsError::InvalidCredential(format!("offer event: {e}")))?;
        event
            .verify()
            .map_err(|e| MlsError::InvalidCredential(format!("offer signature: {e}")))?;
        if event.kind != Kind::from(MLS_KEY_PACKAGE_KIND) {
            return Err(MlsError::InvalidCredential(format!(
                "unexpected offer kind {}",
                event.kind.as_u16()
            )));
        }
        let kp_bytes = BASE64
            .decode(event.content.as_bytes())
            .map_err(|e| MlsError::Serialization(format!("offer base64: {e}")))?;
        let kp_in = KeyPackageIn::tls_deserialize_exact(&kp_bytes)
            .map_err(|e| MlsError::Serialization(format!("key package: {e}")))?;
        let key_package = kp_in
            .validate(self.provider.crypto(), ProtocolVersion::Mls10)
            .map_err(|e| MlsError::InvalidCredential(format!("key package: {e}")))?;

        let pubkey = event.pubkey.to_hex();
        let bound = credential_pubkey(key_package.leaf_node().credential());
        if bound.as_deref() != Some(pubkey.as_str()) {
            return Err(MlsError::InvalidCredential(
                "key package credential does not match event signer".to_string(),
            ));
        }
        Ok((key_package, pubkey))
    }

    fn inspect_welcome(&self, welcome: Welcome) -> WrapperOutcome {
        match ProcessedWelcome::new_from_welcome(
            &self.provider,
            &MlsGroupJoinConfig::default(),
            welcome,
        ) {
            Ok(processed) => {
                let group_id_hex =
                    hex::encode(processed.unverified_group_info().group_id().as_slice());
                WrapperOutcome::Welcome { group_id_hex }
            }
            Err(e) => WrapperOutcome::Unprocessable {
                reason: format!("welcome not addressed to us: {e}"),
                transient: false,
            },
        }
    }

    fn group(&self, group_id_hex: &str) -> Result<&GroupState, MlsError> {
        self.groups.get(group_id_hex).ok_or(MlsError::NoGroup)
    }

    fn group_mut<'a>(
        groups: &'a mut HashMap<String, GroupState>,
        group_id_hex: &str,
    ) -> Result<&'a mut GroupState, MlsError> {
        groups.get_mut(group_id_hex).ok_or(MlsError::NoGroup)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Instant;

    use marmot_proto::{AppContent, AppPayload};

    use super::*;
    use crate::env::Environment;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn unix_now(&self) -> u64 {
            1_700_000_000
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(buffer);
        }
    }

    const ALICE: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const BOB: &str = "0000000000000000000000000000000000000000000000000000000000000002";
    const CAROL: &str = "0000000000000000000000000000000000000000000000000000000000000003";

    fn pair() -> (Identity<TestEnv>, Identity<TestEnv>, String) {
        let mut alice = Identity::new(TestEnv, ALICE).expect("alice");
        let mut bob = Identity::new(TestEnv, BOB).expect("bob");

        let offer = bob.create_key_package(&[]).expect("offer");
        let creation = alice.create_group(&[offer.event_json], &[]).expect("create");
        assert_eq!(creation.recipients, vec![bob.public_key_hex()]);

        let mut admins = BTreeSet::new();
        admins.insert(alice.public_key_hex());
        let joined = bob.accept_welcome(&creation.welcome_b64, &admins).expect("join");
        assert_eq!(joined, creation.group_id_hex);
        (alice, bob, creation.group_id_hex)
    }

    fn text_of(outcome: WrapperOutcome) -> (String, String) {
        match outcome {
            WrapperOutcome::Application { author, payload, .. } => match payload.content {
                AppContent::Text(text) => (author, text),
                other => panic!("expected text, got {other:?}"),
            },
            other => panic!("expected application, got {other:?}"),
        }
    }

    #[test]
    fn two_party_message_roundtrip() {
        let (mut alice, mut bob, group) = pair();
        assert_eq!(alice.current_epoch(&group).expect("epoch"), bob.current_epoch(&group).expect("epoch"));

        let wrapper = alice
            .create_message(&group, &AppPayload::text("Hello B", 11))
            .expect("create");
        let (author, text) = text_of(bob.ingest_wrapper(&wrapper).expect("ingest"));
        assert_eq!(author, alice.public_key_hex());
        assert_eq!(text, "Hello B");

        let reply = bob.create_message(&group, &AppPayload::text("Hi A", 12)).expect("reply");
        let (author, text) = text_of(alice.ingest_wrapper(&reply).expect("ingest"));
        assert_eq!(author, bob.public_key_hex());
        assert_eq!(text, "Hi A");
    }

    #[test]
    fn group_roots_agree_and_stay_stable_across_epochs() {
        let (mut alice, mut bob, group) = pair();
        let root_a = alice.derive_group_root(&group).expect("root");
        let root_b = bob.derive_group_root(&group).expect("root");
        assert_eq!(root_a, root_b);

        // Roots are derived once at connect time; the commit below rotates
        // the exporter, which is why the engine caches the root rather
        // than re-deriving it.
        let update = alice.self_update(&group).expect("rotate");
        match bob.ingest_wrapper(&update.commit_bytes).expect("ingest") {
            WrapperOutcome::Commit { epoch_after, .. } => {
                assert_eq!(epoch_after, update.epoch_after);
            }
            other => panic!("expected commit, got {other:?}"),
        }
        bob.merge_pending_commit(&group).expect("merge");
        assert_eq!(alice.current_epoch(&group).expect("epoch"), 2);
        assert_eq!(bob.current_epoch(&group).expect("epoch"), 2);
    }

    #[test]
    fn epoch_rotation_keeps_messaging_working() {
        let (mut alice, mut bob, group) = pair();
        let update = alice.self_update(&group).expect("rotate");
        bob.ingest_wrapper(&update.commit_bytes).expect("ingest");
        bob.merge_pending_commit(&group).expect("merge");

        let wrapper = alice
            .create_message(&group, &AppPayload::text("post-rotation", 13))
            .expect("create");
        let (_, text) = text_of(bob.ingest_wrapper(&wrapper).expect("ingest"));
        assert_eq!(text, "post-rotation");
    }

    #[test]
    fn future_epoch_wrapper_is_transient_until_merge() {
        let (mut alice, mut bob, group) = pair();

        let update = alice.self_update(&group).expect("rotate");
        let message = alice
            .create_message(&group, &AppPayload::text("from the future", 14))
            .expect("create");

        // Message sealed at epoch 2 arrives before the commit producing
        // epoch 2.
        match bob.ingest_wrapper(&message).expect("ingest") {
            WrapperOutcome::Unprocessable { transient, .. } => assert!(transient),
            other => panic!("expected transient, got {other:?}"),
        }

        bob.ingest_wrapper(&update.commit_bytes).expect("commit");
        bob.merge_pending_commit(&group).expect("merge");
        let (_, text) = text_of(bob.ingest_wrapper(&message).expect("retry"));
        assert_eq!(text, "from the future");
    }

    #[test]
    fn three_party_add_and_roster() {
        let (mut alice, mut bob, group) = pair();
        let mut carol = Identity::new(TestEnv, CAROL).expect("carol");

        let offer = carol.create_key_package(&[]).expect("offer");
        let artifacts = alice.add_members(&group, &[offer.event_json]).expect("add");
        assert_eq!(artifacts.recipients, vec![carol.public_key_hex()]);

        bob.ingest_wrapper(&artifacts.commit.commit_bytes).expect("ingest");
        bob.merge_pending_commit(&group).expect("merge");

        let mut admins = BTreeSet::new();
        admins.insert(alice.public_key_hex());
        carol.accept_welcome(&artifacts.welcome_b64, &admins).expect("join");

        for identity in [&alice, &bob, &carol] {
            let members = identity.list_members(&group).expect("members");
            let pubkeys: Vec<_> = members.iter().map(|m| m.pubkey.clone()).collect();
            assert_eq!(members.len(), 3);
            assert!(pubkeys.contains(&alice.public_key_hex()));
            assert!(pubkeys.contains(&bob.public_key_hex()));
            assert!(pubkeys.contains(&carol.public_key_hex()));
        }

        // Admin flag present only on the creator.
        let roster = carol.list_members(&group).expect("members");
        for member in roster {
            assert_eq!(member.is_admin, member.pubkey == alice.public_key_hex());
        }

        // Every pair can exchange messages after the add.
        let from_carol = carol
            .create_message(&group, &AppPayload::text("happy to join", 15))
            .expect("create");
        let (_, text) = text_of(alice.ingest_wrapper(&from_carol).expect("ingest"));
        assert_eq!(text, "happy to join");
        let (_, text) = text_of(bob.ingest_wrapper(&from_carol).expect("ingest"));
        assert_eq!(text, "happy to join");
    }

    #[test]
    fn removed_member_observes_removal() {
        let (mut alice, mut bob, group) = pair();
        let removal = alice
            .remove_member(&group, &bob.public_key_hex())
            .expect("remove");

        bob.ingest_wrapper(&removal.commit_bytes).expect("ingest");
        let outcome = bob.merge_pending_commit(&group).expect("merge");
        assert!(outcome.removed_self);
        assert_eq!(bob.group_phase(&group), Some(GroupPhase::Removed));
        assert!(matches!(
            bob.create_message(&group, &AppPayload::text("?", 1)),
            Err(MlsError::RemovedFromGroup)
        ));
    }

    #[test]
    fn stale_welcome_rejected_after_reimport() {
        let mut alice = Identity::new(TestEnv, ALICE).expect("alice");
        let mut bob = Identity::new(TestEnv, BOB).expect("bob");

        let offer = bob.create_key_package(&[]).expect("offer");
        bob.import_key_package_bundle(&offer.bundle_b64).expect("reimport");
        let creation = alice.create_group(&[offer.event_json], &[]).expect("create");

        let admins = BTreeSet::new();
        bob.accept_welcome(&creation.welcome_b64, &admins).expect("join");
        // Accepting the same welcome again must fail as stale, not corrupt
        // the joined state.
        let again = bob.accept_welcome(&creation.welcome_b64, &admins);
        assert!(matches!(again, Err(MlsError::StaleWelcome(_))));
    }

    #[test]
    fn media_base_keys_agree_and_separate_by_track_and_epoch() {
        let (mut alice, mut bob, group) = pair();
        let sender = alice.public_key_hex();

        let a = alice.derive_media_base_key(&group, &sender, "mic-0").expect("derive");
        let b = bob.derive_media_base_key(&group, &sender, "mic-0").expect("derive");
        assert_eq!(a, b);

        let other_track = alice.derive_media_base_key(&group, &sender, "mic-1").expect("derive");
        assert_ne!(a, other_track);

        let update = alice.self_update(&group).expect("rotate");
        bob.ingest_wrapper(&update.commit_bytes).expect("ingest");
        bob.merge_pending_commit(&group).expect("merge");
        let after_a = alice.derive_media_base_key(&group, &sender, "mic-0").expect("derive");
        let after_b = bob.derive_media_base_key(&group, &sender, "mic-0").expect("derive");
        assert_eq!(after_a, after_b);
        assert_ne!(a, after_a);
    }

    #[test]
    fn identity_is_idempotent_per_secret() {
        let first = Identity::new(TestEnv, ALICE).expect("first");
        let second = Identity::new(TestEnv, ALICE).expect("second");
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }
}
