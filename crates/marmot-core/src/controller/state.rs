//! Controller state and operation handlers.
//!
//! Everything here runs on the engine thread under a single mutable
//! borrow per operation. Handlers never call the host callback directly;
//! they append `Operation::Emit` so events fire after the borrow ends.
//!
//! Roster policy: the MLS handle's `list_members` is the single source of
//! truth. The bridge's subscription set is derived from it and only ever
//! grows; a member that leaves keeps its (now silent) subscription and is
//! surfaced as `MemberLeft`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use marmot_proto::auth::{CapabilityClaims, MoqAuth, CAPABILITY_VERSION};
use marmot_proto::envelope::{HandshakeEnvelope, HandshakePayload};
use marmot_proto::paths::GroupRoot;
use marmot_proto::{AdminUpdate, AppContent, AppPayload, TrackAnnounce, TrackDirectory};

use crate::bridge::{BridgeAction, BridgeConfig, MoqConnectParams, MoqListener, MoqService, TransportBridge};
use crate::env::Environment;
use crate::error::{EngineError, ErrorKind, RecoveryAction};
use crate::handshake::{HandshakeAction, HandshakeConfig, HandshakeMachine};
use crate::mls::{Identity, KeyPackageOffer, MlsError, WrapperOutcome};

use super::error::InviteError;
use super::events::{AudioFrameSink, ChatEvent, EventCallback, SessionParams};
use super::services::{RelayConnectParams, RelayListener, RelayService};
use super::Operation;

/// Bound on frames parked for retry after a transient ingest failure.
const MAX_PENDING_FRAMES: usize = 32;

/// Bound on retries per parked frame before it is dropped.
const MAX_FRAME_RETRIES: u32 = 8;

/// Lifetime of self-issued transport capabilities.
const CAPABILITY_TTL_SECS: u64 = 3600;

/// Everything the controller needs to start.
pub struct ControllerConfig<E: Environment> {
    /// Time and randomness source
    pub env: E,
    /// Session bootstrap input
    pub session: SessionParams,
    /// Signalling relay driver
    pub relay: Rc<dyn RelayService>,
    /// MoQ driver
    pub moq: Rc<dyn MoqService>,
    /// Host event callback
    pub callback: EventCallback,
    /// Optional sink for inbound encrypted audio frames
    pub audio_sink: Option<AudioFrameSink>,
}

struct PendingFrame {
    bytes: Vec<u8>,
    attempts: u32,
}

pub(crate) struct ControllerState<E: Environment> {
    env: E,
    pub(crate) identity: Identity<E>,
    session: SessionParams,
    relay: Rc<dyn RelayService>,
    moq: Rc<dyn MoqService>,
    pub(crate) callback: EventCallback,
    pub(crate) audio_sink: Option<AudioFrameSink>,
    handshake: HandshakeMachine<E::Instant>,
    bridge: TransportBridge<E::Instant>,
    pub(crate) group_id_hex: Option<String>,
    pub(crate) group_root: Option<GroupRoot>,
    commits: u32,
    offer_cache: Option<KeyPackageOffer>,
    welcome_cache: Option<(String, String)>,
    pending_frames: VecDeque<PendingFrame>,
    pending_invites: BTreeMap<String, bool>,
    roster_snapshot: BTreeSet<String>,
    pub(crate) stopped: bool,
}

impl<E: Environment> ControllerState<E> {
    pub(crate) fn new(config: ControllerConfig<E>) -> Result<Self, EngineError> {
        let identity = Identity::new(config.env.clone(), &config.session.secret_hex)
            .map_err(|e| EngineError::new(ErrorKind::FatalConfig, e.to_string()).with_source(e))?;
        let handshake = HandshakeMachine::new(
            config.session.role,
            identity.public_key_hex(),
            HandshakeConfig::default(),
            config.env.now(),
        );
        Ok(Self {
            identity,
            handshake,
            bridge: TransportBridge::new(BridgeConfig::default()),
            session: config.session,
            relay: config.relay,
            moq: config.moq,
            callback: config.callback,
            audio_sink: config.audio_sink,
            env: config.env,
            group_id_hex: None,
            group_root: None,
            commits: 0,
            offer_cache: None,
            welcome_cache: None,
            pending_frames: VecDeque::new(),
            pending_invites: BTreeMap::new(),
            roster_snapshot: BTreeSet::new(),
            stopped: false,
        })
    }

    // ─── bootstrap ──────────────────────────────────────────────────

    pub(crate) fn on_start(&mut self, ops: &mut Vec<Operation>, listener: Rc<dyn RelayListener>) {
        self.emit(ops, ChatEvent::status("Connecting to signalling relay…"));
        self.relay.connect(
            RelayConnectParams {
                url: self.session.signalling_url.clone(),
                session_id: self.session.session_id.clone(),
            },
            listener,
        );
        let actions = self.handshake.start(self.env.now());
        self.run_handshake_actions(ops, actions);
    }

    pub(crate) fn on_relay_event(&mut self, ops: &mut Vec<Operation>, event: nostr::Event) {
        let envelope = match HandshakeEnvelope::open(&event, &self.session.session_id) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("ignoring bad relay event: {e}");
                return;
            }
        };
        let actions = self.handshake.on_envelope(&event.id.to_hex(), &envelope);
        self.run_handshake_actions(ops, actions);
    }

    pub(crate) fn on_tick(&mut self, ops: &mut Vec<Operation>) {
        let now = self.env.now();
        let handshake_actions = self.handshake.tick(now);
        self.run_handshake_actions(ops, handshake_actions);
        let bridge_actions = self.bridge.tick(now);
        self.run_bridge_actions(ops, bridge_actions);
    }

    fn run_handshake_actions(&mut self, ops: &mut Vec<Operation>, actions: Vec<HandshakeAction>) {
        for action in actions {
            match action {
                HandshakeAction::PublishKeyPackageOffer => self.publish_offer(ops),
                HandshakeAction::PublishWelcomeRequest => {
                    self.publish_envelope(HandshakePayload::RequestWelcome {
                        pubkey: Some(self.identity.public_key_hex()),
                    });
                }
                HandshakeAction::PublishKeyPackageRequest { target } => {
                    let target = target.or_else(|| self.session.peer_pubkeys.first().cloned());
                    self.publish_envelope(HandshakePayload::RequestKeyPackage { pubkey: target });
                }
                HandshakeAction::AnswerWelcome { target } => {
                    if let Some((welcome, group_id_hex)) = self.welcome_cache.clone() {
                        self.publish_envelope(HandshakePayload::Welcome {
                            welcome,
                            group_id_hex: Some(group_id_hex),
                            moq_root: self.root_string(),
                            recipient: target,
                        });
                    }
                }
                HandshakeAction::AcceptKeyPackage { event_json, bundle: _, pubkey } => {
                    self.on_key_package_offer(ops, event_json, pubkey);
                }
                HandshakeAction::AcceptWelcome { welcome_b64, group_id_hex, moq_root } => {
                    self.on_welcome(ops, welcome_b64, group_id_hex, moq_root);
                }
                HandshakeAction::PhaseChanged(phase) => {
                    self.emit(ops, ChatEvent::Handshake { phase });
                }
                HandshakeAction::TimedOut => {
                    self.fail(
                        ops,
                        EngineError::new(
                            ErrorKind::HandshakeTimeout,
                            "Handshake did not complete in time. Refresh and try again.",
                        ),
                    );
                }
            }
        }
    }

    fn publish_offer(&mut self, ops: &mut Vec<Operation>) {
        if self.offer_cache.is_none() {
            let hints = vec![self.session.signalling_url.clone()];
            match self.identity.create_key_package(&hints) {
                Ok(offer) => self.offer_cache = Some(offer),
                Err(e) => {
                    self.fail(ops, e.into());
                    return;
                }
            }
        }
        if let Some(offer) = self.offer_cache.clone() {
            self.publish_envelope(HandshakePayload::KeyPackage {
                event: offer.event_json,
                bundle: Some(offer.bundle_b64),
                pubkey: Some(self.identity.public_key_hex()),
            });
        }
    }

    /// Creator side: a key-package offer arrived. The first one forms the
    /// group; later ones are invite-driven additions.
    fn on_key_package_offer(
        &mut self,
        ops: &mut Vec<Operation>,
        event_json: String,
        offer_pubkey: Option<String>,
    ) {
        if !self.handshake.is_established() {
            match self.identity.create_group(&[event_json], &self.session.admin_pubkeys) {
                Ok(creation) => {
                    self.group_id_hex = Some(creation.group_id_hex.clone());
                    self.welcome_cache =
                        Some((creation.welcome_b64.clone(), creation.group_id_hex.clone()));
                    // The root is derived once, at the founding epoch, and
                    // carried to every joiner; exporter output at later
                    // epochs would differ.
                    match self.identity.derive_group_root(&creation.group_id_hex) {
                        Ok(root) => self.group_root = Some(root),
                        Err(e) => {
                            self.fail(ops, e.into());
                            return;
                        }
                    }
                    self.emit(ops, ChatEvent::status("Group created; sending welcome…"));
                    let recipient =
                        offer_pubkey.or_else(|| creation.recipients.first().cloned());
                    self.publish_envelope(HandshakePayload::Welcome {
                        welcome: creation.welcome_b64,
                        group_id_hex: Some(creation.group_id_hex),
                        moq_root: self.root_string(),
                        recipient,
                    });
                    let actions = self.handshake.established();
                    self.run_handshake_actions(ops, actions);
                    ops.push(Operation::ConnectTransport);
                    self.sync_roster(ops);
                    self.publish_admin_update(ops);
                }
                Err(e) => self.fail(ops, e.into()),
            }
            return;
        }

        // Addition path: answer an invite with an add commit + welcome.
        let Some(group_id) = self.group_id_hex.clone() else {
            return;
        };
        match self.identity.add_members(&group_id, &[event_json]) {
            Ok(artifacts) => {
                self.commits += 1;
                let recipient = artifacts.recipients.first().cloned().unwrap_or_default();
                let requested_admin =
                    self.pending_invites.remove(&recipient).unwrap_or(false);
                if requested_admin {
                    if let Err(e) = self.identity.set_admin(&group_id, &recipient, true) {
                        tracing::warn!("failed to flag admin for {recipient}: {e}");
                    }
                }
                self.welcome_cache = Some((artifacts.welcome_b64.clone(), group_id.clone()));
                self.publish_wrapper(ops, artifacts.commit.commit_bytes);
                self.publish_envelope(HandshakePayload::Welcome {
                    welcome: artifacts.welcome_b64,
                    group_id_hex: Some(group_id),
                    moq_root: self.root_string(),
                    recipient: Some(recipient.clone()),
                });
                self.emit(
                    ops,
                    ChatEvent::InviteGenerated { recipient, is_admin: requested_admin },
                );
                self.emit(ops, ChatEvent::Commit { total: self.commits });
                self.sync_roster(ops);
                self.publish_admin_update(ops);
            }
            Err(MlsError::MemberAlreadyPresent { pubkey }) => {
                tracing::debug!("duplicate offer from {pubkey}, already a member");
            }
            Err(e) => {
                tracing::warn!("invite addition failed: {e}");
                self.emit(
                    ops,
                    ChatEvent::transient_error(
                        "Invite failed. Verify the participant key and try again.",
                    ),
                );
            }
        }
    }

    /// Invitee side: a welcome arrived.
    fn on_welcome(
        &mut self,
        ops: &mut Vec<Operation>,
        welcome_b64: String,
        claimed_group_id: Option<String>,
        moq_root: Option<String>,
    ) {
        if let Some(offer) = self.offer_cache.clone() {
            // Reinsert the bundle in case the offer outlived this
            // process's provider storage.
            if let Err(e) = self.identity.import_key_package_bundle(&offer.bundle_b64) {
                tracing::debug!("bundle reimport skipped: {e}");
            }
        }
        self.emit(ops, ChatEvent::status("Accepting welcome…"));

        let mut admins: BTreeSet<String> = self.session.admin_pubkeys.iter().cloned().collect();
        if admins.is_empty() {
            // Without out-of-band admin knowledge, the inviting creator
            // is the sole admin.
            if let Some(creator) = self.session.peer_pubkeys.first() {
                admins.insert(creator.clone());
            }
        }

        match self.identity.accept_welcome(&welcome_b64, &admins) {
            Ok(group_id_hex) => {
                if let Some(claimed) = claimed_group_id {
                    if claimed != group_id_hex {
                        tracing::warn!(
                            claimed,
                            accepted = group_id_hex,
                            "welcome group id differs from sender's claim"
                        );
                    }
                }
                self.emit(ops, ChatEvent::status(format!("Joined group {group_id_hex}")));
                self.group_id_hex = Some(group_id_hex);
                // Prefer the carried root: a member joining after the
                // founding epoch cannot re-derive it from its exporter.
                if let Some(root) = moq_root.as_deref() {
                    match GroupRoot::parse(root) {
                        Ok(root) => self.group_root = Some(root),
                        Err(e) => tracing::warn!("ignoring malformed carried root: {e}"),
                    }
                }
                let actions = self.handshake.established();
                self.run_handshake_actions(ops, actions);
                ops.push(Operation::ConnectTransport);
                self.sync_roster(ops);
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("stale welcome rejected: {e}");
                self.handshake.welcome_rejected();
                self.emit(ops, ChatEvent::transient_error("Stale welcome; retrying handshake."));
            }
            Err(e) => self.fail(ops, e.into()),
        }
    }

    fn publish_envelope(&self, payload: HandshakePayload) {
        let envelope = HandshakeEnvelope {
            session: self.session.session_id.clone(),
            from: self.session.role,
            created_at: self.env.unix_now(),
            payload,
        };
        match envelope.seal(self.identity.keys()) {
            Ok(event) => self.relay.publish(event),
            Err(e) => tracing::error!("failed to seal handshake envelope: {e}"),
        }
    }

    // ─── transport ──────────────────────────────────────────────────

    pub(crate) fn on_connect_transport(
        &mut self,
        ops: &mut Vec<Operation>,
        listener: Rc<dyn MoqListener>,
    ) {
        let Some(group_id) = self.group_id_hex.clone() else {
            return;
        };
        let root = match &self.group_root {
            Some(root) => root.clone(),
            None => match self.identity.derive_group_root(&group_id) {
                Ok(root) => {
                    self.group_root = Some(root.clone());
                    root
                }
                Err(e) => {
                    self.fail(ops, e.into());
                    return;
                }
            },
        };

        let me = self.identity.public_key_hex();
        let claims = CapabilityClaims {
            ver: CAPABILITY_VERSION,
            kid: me.clone(),
            root: root.as_str().to_string(),
            get: vec!["*".to_string()],
            put: vec![format!("wrappers/{me}"), format!("audio/{me}/*")],
            exp: self.env.unix_now() + CAPABILITY_TTL_SECS,
            nbf: None,
            aud: None,
            jti: None,
        };
        let auth = match claims.issue(self.identity.keys()) {
            Ok(token) => Some(MoqAuth::Capability(token)),
            Err(e) => {
                tracing::warn!("capability issuance failed, connecting unauthenticated: {e}");
                None
            }
        };

        let peers: Vec<String> = self
            .identity
            .list_members(&group_id)
            .map(|members| {
                members.into_iter().map(|m| m.pubkey).filter(|p| p != &me).collect()
            })
            .unwrap_or_else(|_| {
                self.session.peer_pubkeys.iter().filter(|p| **p != me).cloned().collect()
            });

        self.emit(ops, ChatEvent::status("Connecting media transport…"));
        self.moq.connect(
            MoqConnectParams {
                url: self.session.moq_url.clone(),
                root,
                own_pubkey: me,
                peer_pubkeys: peers.clone(),
                auth,
            },
            listener,
        );
        self.bridge.connected(self.env.now());

        // Open every subscription recorded so far (roster syncs may have
        // run before the session existed) plus the current roster.
        let mut to_subscribe: BTreeSet<String> = self.bridge.subscribed_peers().into_iter().collect();
        to_subscribe.extend(peers);
        for peer in to_subscribe {
            let _ = self.bridge.ensure_subscribed(&peer);
            self.moq.subscribe_peer(&peer);
        }
    }

    pub(crate) fn on_transport_ready(&mut self, ops: &mut Vec<Operation>) {
        let actions = self.bridge.on_ready();
        self.run_bridge_actions(ops, actions);
    }

    pub(crate) fn on_transport_closed(&mut self, ops: &mut Vec<Operation>) {
        self.emit(ops, ChatEvent::status("Media transport closed"));
    }

    pub(crate) fn on_transport_error(&mut self, ops: &mut Vec<Operation>, message: String) {
        tracing::warn!("transport error: {message}");
        self.emit(
            ops,
            ChatEvent::Error {
                message,
                fatal: false,
                recovery: RecoveryAction::CheckConnection,
            },
        );
    }

    pub(crate) fn on_subscribe_failed(
        &mut self,
        ops: &mut Vec<Operation>,
        peer: String,
        transient: bool,
        message: String,
    ) {
        tracing::warn!(peer, transient, "subscribe failed: {message}");
        self.bridge.subscribe_failed(&peer, transient, self.env.now());
        if !transient {
            self.emit(
                ops,
                ChatEvent::Error {
                    message: format!("Lost subscription to {}: {message}", short_key(&peer)),
                    fatal: false,
                    recovery: RecoveryAction::CheckConnection,
                },
            );
        }
    }

    fn publish_wrapper(&mut self, ops: &mut Vec<Operation>, bytes: Vec<u8>) {
        let actions = self.bridge.publish_or_queue(bytes);
        self.run_bridge_actions(ops, actions);
    }

    fn run_bridge_actions(&mut self, ops: &mut Vec<Operation>, actions: Vec<BridgeAction>) {
        for action in actions {
            match action {
                BridgeAction::Publish(bytes) => self.moq.publish(&bytes),
                BridgeAction::Subscribe(peer) => self.moq.subscribe_peer(&peer),
                BridgeAction::Ready => {
                    self.emit(ops, ChatEvent::Ready { ready: true });
                    if self.handshake.is_established() {
                        self.emit(
                            ops,
                            ChatEvent::Handshake { phase: super::events::HandshakePhase::Connected },
                        );
                    }
                }
            }
        }
    }

    // ─── messaging ──────────────────────────────────────────────────

    pub(crate) fn on_send_message(&mut self, ops: &mut Vec<Operation>, content: String) {
        let Some(group_id) = self.group_id_hex.clone() else {
            self.emit(ops, ChatEvent::transient_error("Not connected to a group yet."));
            return;
        };
        let payload = AppPayload::text(content.clone(), self.env.unix_now());
        match self.identity.create_message(&group_id, &payload) {
            Ok(bytes) => {
                self.publish_wrapper(ops, bytes);
                self.emit(
                    ops,
                    ChatEvent::Message {
                        author: self.identity.public_key_hex(),
                        content,
                        created_at: payload.created_at,
                        local: true,
                    },
                );
            }
            Err(e) => self.fail(ops, e.into()),
        }
    }

    pub(crate) fn on_announce_track(&mut self, ops: &mut Vec<Operation>, label: String) {
        let Some(group_id) = self.group_id_hex.clone() else {
            self.emit(ops, ChatEvent::transient_error("Not connected to a group yet."));
            return;
        };
        let directory = TrackDirectory {
            tracks: vec![TrackAnnounce { pubkey: self.identity.public_key_hex(), label }],
        };
        let payload = AppPayload::directory(directory, self.env.unix_now());
        match self.identity.create_message(&group_id, &payload) {
            Ok(bytes) => self.publish_wrapper(ops, bytes),
            Err(e) => self.fail(ops, e.into()),
        }
    }

    pub(crate) fn on_rotate_epoch(&mut self, ops: &mut Vec<Operation>) {
        let Some(group_id) = self.group_id_hex.clone() else {
            self.emit(ops, ChatEvent::transient_error("Not connected to a group yet."));
            return;
        };
        match self.identity.self_update(&group_id) {
            Ok(commit) => {
                self.commits += 1;
                self.publish_wrapper(ops, commit.commit_bytes);
                self.emit(ops, ChatEvent::Commit { total: self.commits });
            }
            Err(e) => self.fail(ops, e.into()),
        }
    }

    pub(crate) fn on_ingest_frame(&mut self, ops: &mut Vec<Operation>, bytes: Vec<u8>) {
        self.handle_wrapper(ops, bytes, 0, false);
    }

    /// Ingest one wrapper. Returns true when the wrapper made progress
    /// (message delivered, commit merged).
    fn handle_wrapper(
        &mut self,
        ops: &mut Vec<Operation>,
        bytes: Vec<u8>,
        attempts: u32,
        in_drain: bool,
    ) -> bool {
        let outcome = match self.identity.ingest_wrapper(&bytes) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(ops, e.into());
                return false;
            }
        };
        match outcome {
            WrapperOutcome::Application { group_id_hex, author, payload } => {
                self.handshake.note_peer_traffic();
                match payload.content {
                    AppContent::Text(content) => {
                        let local = author == self.identity.public_key_hex();
                        self.emit(
                            ops,
                            ChatEvent::Message {
                                author,
                                content,
                                created_at: payload.created_at,
                                local,
                            },
                        );
                    }
                    AppContent::Directory(directory) => {
                        let me = self.identity.public_key_hex();
                        for track in directory.tracks {
                            if track.pubkey != me {
                                self.moq.subscribe_peer_audio(&track.pubkey, &track.label);
                            }
                        }
                    }
                    AppContent::Admins(update) => {
                        self.apply_admin_update(ops, &group_id_hex, &author, update);
                    }
                }
                true
            }
            WrapperOutcome::Commit { group_id_hex, .. } => {
                match self.identity.merge_pending_commit(&group_id_hex) {
                    Ok(merge) => {
                        self.commits += 1;
                        self.emit(ops, ChatEvent::Commit { total: self.commits });
                        if merge.removed_self {
                            self.emit(
                                ops,
                                ChatEvent::MemberLeft { pubkey: self.identity.public_key_hex() },
                            );
                            self.fail(
                                ops,
                                EngineError::new(
                                    ErrorKind::FatalCrypto,
                                    "This member was removed from the group.",
                                ),
                            );
                        } else {
                            self.sync_roster(ops);
                            if !in_drain {
                                self.drain_pending(ops);
                            }
                        }
                        true
                    }
                    Err(e) => {
                        self.fail(ops, e.into());
                        false
                    }
                }
            }
            WrapperOutcome::Proposal { group_id_hex } => {
                tracing::debug!(group = group_id_hex, "stored proposal");
                true
            }
            WrapperOutcome::Welcome { group_id_hex } => {
                // Late welcome on the wrappers track; harmless once the
                // group is joined.
                tracing::debug!(group = group_id_hex, "ignoring transport welcome");
                false
            }
            WrapperOutcome::Unprocessable { reason, transient: true } => {
                tracing::debug!("parking transient wrapper: {reason}");
                self.queue_pending(bytes, attempts);
                false
            }
            WrapperOutcome::Unprocessable { reason, transient: false } => {
                self.fail(ops, EngineError::new(ErrorKind::FatalCrypto, reason));
                false
            }
        }
    }

    fn queue_pending(&mut self, bytes: Vec<u8>, attempts: u32) {
        if attempts >= MAX_FRAME_RETRIES {
            tracing::warn!(attempts, "dropping wrapper after retry budget");
            return;
        }
        if self.pending_frames.len() >= MAX_PENDING_FRAMES {
            self.pending_frames.pop_front();
            tracing::warn!("pending-frame queue full, dropping oldest");
        }
        self.pending_frames.push_back(PendingFrame { bytes, attempts: attempts + 1 });
    }

    /// Replay parked frames in arrival order after each merge; loop while
    /// the replays themselves make progress.
    fn drain_pending(&mut self, ops: &mut Vec<Operation>) {
        loop {
            if self.pending_frames.is_empty() {
                return;
            }
            let parked: Vec<PendingFrame> = self.pending_frames.drain(..).collect();
            let mut progressed = false;
            for frame in parked {
                progressed |= self.handle_wrapper(ops, frame.bytes, frame.attempts, true);
            }
            if !progressed {
                return;
            }
        }
    }

    // ─── membership ─────────────────────────────────────────────────

    pub(crate) fn on_invite_member(
        &mut self,
        ops: &mut Vec<Operation>,
        pubkey_input: String,
        is_admin: bool,
    ) {
        match self.validate_invite(&pubkey_input) {
            Ok(pubkey) => {
                self.pending_invites.insert(pubkey.clone(), is_admin);
                self.emit(
                    ops,
                    ChatEvent::status(format!(
                        "Requesting key package from {}",
                        short_key(&pubkey)
                    )),
                );
                self.publish_envelope(HandshakePayload::RequestKeyPackage { pubkey: Some(pubkey) });
            }
            Err(e) => {
                tracing::warn!("invite rejected: {e}");
                self.emit(ops, ChatEvent::transient_error(e.user_message()));
            }
        }
    }

    fn validate_invite(&self, pubkey_input: &str) -> Result<String, InviteError> {
        let trimmed = pubkey_input.trim();
        if trimmed.is_empty() {
            return Err(InviteError::EmptyPubkey);
        }
        let parsed = nostr::PublicKey::parse(trimmed)
            .map_err(|e| InviteError::InvalidPubkey(e.to_string()))?;
        let pubkey = parsed.to_hex();

        let group_id = self.group_id_hex.as_ref().ok_or(InviteError::NoGroup)?;
        let me = self.identity.public_key_hex();
        if pubkey == me {
            return Err(InviteError::SelfInvite);
        }
        if !self.identity.is_admin(group_id, &me) {
            return Err(InviteError::NotAdmin);
        }
        let members = self.identity.list_members(group_id).unwrap_or_default();
        if members.iter().any(|m| m.pubkey == pubkey) {
            return Err(InviteError::AlreadyPresent);
        }
        if self.pending_invites.contains_key(&pubkey) {
            return Err(InviteError::AlreadyPending);
        }
        Ok(pubkey)
    }

    pub(crate) fn on_remove_member(&mut self, ops: &mut Vec<Operation>, pubkey: String) {
        let Some(group_id) = self.group_id_hex.clone() else {
            self.emit(ops, ChatEvent::transient_error("Not connected to a group yet."));
            return;
        };
        let me = self.identity.public_key_hex();
        if !self.identity.is_admin(&group_id, &me) {
            self.emit(ops, ChatEvent::transient_error(InviteError::NotAdmin.user_message()));
            return;
        }
        match self.identity.remove_member(&group_id, &pubkey) {
            Ok(commit) => {
                self.commits += 1;
                self.publish_wrapper(ops, commit.commit_bytes);
                self.emit(ops, ChatEvent::Commit { total: self.commits });
                self.sync_roster(ops);
                self.publish_admin_update(ops);
            }
            Err(MlsError::MemberNotFound { pubkey }) => {
                self.emit(
                    ops,
                    ChatEvent::transient_error(format!(
                        "{} is not in the roster.",
                        short_key(&pubkey)
                    )),
                );
            }
            Err(e) => self.fail(ops, e.into()),
        }
    }

    /// Publish the authoritative admin set. Paired with every membership
    /// commit so all replicas converge on the same flags at the same
    /// epoch; the MLS tree itself does not carry admin rights.
    fn publish_admin_update(&mut self, ops: &mut Vec<Operation>) {
        let Some(group_id) = self.group_id_hex.clone() else {
            return;
        };
        let admins: Vec<String> = match self.identity.admin_set(&group_id) {
            Ok(set) => set.into_iter().collect(),
            Err(e) => {
                tracing::warn!("admin set unavailable: {e}");
                return;
            }
        };
        let payload = AppPayload::admins(AdminUpdate { admins }, self.env.unix_now());
        match self.identity.create_message(&group_id, &payload) {
            Ok(bytes) => self.publish_wrapper(ops, bytes),
            Err(e) => tracing::warn!("failed to publish admin update: {e}"),
        }
    }

    /// Apply a received admin update. Only a current admin may change the
    /// set; flag flips surface as `MemberUpdated` plus a fresh roster.
    fn apply_admin_update(
        &mut self,
        ops: &mut Vec<Operation>,
        group_id: &str,
        author: &str,
        update: AdminUpdate,
    ) {
        if !self.identity.is_admin(group_id, author) {
            tracing::warn!(author, "ignoring admin update from non-admin");
            return;
        }
        let new_set: BTreeSet<String> = update.admins.into_iter().collect();
        let old_set = self.identity.admin_set(group_id).unwrap_or_default();
        if new_set == old_set {
            return;
        }
        if let Err(e) = self.identity.set_admins(group_id, new_set.clone()) {
            tracing::warn!("failed to apply admin update: {e}");
            return;
        }
        let members = self.identity.list_members(group_id).unwrap_or_default();
        for member in &members {
            if old_set.contains(&member.pubkey) != member.is_admin {
                self.emit(ops, ChatEvent::MemberUpdated { member: member.clone() });
            }
        }
        if !members.is_empty() {
            self.emit(ops, ChatEvent::Roster { members });
        }
    }

    /// Re-read the roster from the MLS handle, subscribe to new peers,
    /// and surface joins/leaves. Runs after every merge.
    fn sync_roster(&mut self, ops: &mut Vec<Operation>) {
        let Some(group_id) = self.group_id_hex.clone() else {
            return;
        };
        let members = match self.identity.list_members(&group_id) {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!("failed to list members: {e}");
                return;
            }
        };
        let me = self.identity.public_key_hex();
        let current: BTreeSet<String> = members.iter().map(|m| m.pubkey.clone()).collect();

        for member in &members {
            if member.pubkey != me && !self.roster_snapshot.contains(&member.pubkey) {
                tracing::debug!(peer = %short_key(&member.pubkey), "subscribing to new member");
                let actions = self.bridge.ensure_subscribed(&member.pubkey);
                // Before the session exists the intent is only recorded;
                // connect-time setup opens it.
                if self.bridge.is_connected() {
                    self.run_bridge_actions(ops, actions);
                }
                self.emit(ops, ChatEvent::MemberJoined { member: member.clone() });
            }
        }
        let left: Vec<String> = self
            .roster_snapshot
            .iter()
            .filter(|p| !current.contains(*p) && **p != me)
            .cloned()
            .collect();
        for pubkey in left {
            self.emit(ops, ChatEvent::MemberLeft { pubkey });
        }

        self.roster_snapshot = current;
        if !members.is_empty() {
            self.emit(ops, ChatEvent::Roster { members });
        }
    }

    // ─── shutdown & helpers ─────────────────────────────────────────

    pub(crate) fn on_shutdown(&mut self, ops: &mut Vec<Operation>) {
        self.moq.close();
        self.relay.shutdown();
        self.stopped = true;
        self.emit(ops, ChatEvent::Ready { ready: false });
    }

    pub(crate) fn current_epoch(&self) -> Option<u64> {
        let group_id = self.group_id_hex.as_ref()?;
        self.identity.current_epoch(group_id).ok()
    }

    fn emit(&self, ops: &mut Vec<Operation>, event: ChatEvent) {
        ops.push(Operation::Emit(event));
    }

    fn root_string(&self) -> Option<String> {
        self.group_root.as_ref().map(|root| root.as_str().to_string())
    }

    fn fail(&mut self, ops: &mut Vec<Operation>, error: EngineError) {
        if error.is_fatal() {
            tracing::error!("fatal engine error: {error}");
            self.stopped = true;
            self.emit(ops, ChatEvent::fatal_error(error.message.clone(), error.recovery()));
        } else {
            tracing::warn!("transient engine error: {error}");
            self.emit(ops, ChatEvent::transient_error(error.message.clone()));
        }
    }
}

fn short_key(key: &str) -> String {
    if key.len() <= 12 {
        key.to_string()
    } else {
        format!("{}…{}", &key[..6], &key[key.len() - 4..])
    }
}
