//! Controller and single-threaded operation queue.
//!
//! The controller sequences everything: it drives the bootstrap
//! handshake, owns the MLS handle, maps roster changes onto transport
//! subscriptions, and surfaces a typed event stream to the host.
//!
//! # Scheduling model
//!
//! Single-threaded cooperative. Every entry point (host API calls,
//! relay events, transport frames, timer ticks) enqueues an
//! [`Operation`]; the queue drains sequentially, one mutable borrow of
//! the state per operation. Service listener callbacks only enqueue, so
//! nothing re-enters the state, and the host callback fires between
//! operations, never inside one.

pub mod error;
pub mod events;
pub mod services;
mod state;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::bridge::MoqListener;
use crate::env::Environment;
use crate::error::EngineError;

pub use error::InviteError;
pub use events::{
    AudioFrameSink, BootstrapRole, ChatEvent, EventCallback, HandshakePhase, MemberInfo,
    RecoveryAction, SessionParams,
};
pub use state::ControllerConfig;

use services::RelayListener;
use state::ControllerState;

/// One unit of work on the controller queue.
#[derive(Clone)]
pub(crate) enum Operation {
    /// Begin the bootstrap handshake
    Start,
    /// Advance handshake/bridge timers
    Tick,
    /// A relay event arrived
    RelayEvent(Box<nostr::Event>),
    /// The group is known; open the media transport
    ConnectTransport,
    /// A wrapper frame arrived from some peer's track
    IncomingFrame(Vec<u8>),
    /// An encrypted audio frame arrived
    IncomingAudioFrame {
        peer: String,
        label: String,
        bytes: Vec<u8>,
    },
    /// The publish track was accepted
    TransportReady,
    /// The transport session closed
    TransportClosed,
    /// The transport session failed
    TransportError { message: String },
    /// A subscription attempt failed
    SubscribeFailed {
        peer: String,
        transient: bool,
        message: String,
    },
    /// Host: send a text message
    SendMessage(String),
    /// Host: announce an audio track in the encrypted directory
    AnnounceTrack(String),
    /// Host: rotate the epoch
    RotateEpoch,
    /// Host: invite a member
    InviteMember { pubkey: String, is_admin: bool },
    /// Host: remove a member
    RemoveMember { pubkey: String },
    /// Deliver an event to the host callback
    Emit(ChatEvent),
    /// Tear everything down
    Shutdown,
}

struct RuntimeCore<E: Environment> {
    state: RefCell<ControllerState<E>>,
    queue: RefCell<VecDeque<Operation>>,
    pumping: Cell<bool>,
}

impl<E: Environment> RuntimeCore<E> {
    fn enqueue(self: &Rc<Self>, op: Operation) {
        self.queue.borrow_mut().push_back(op);
        self.pump();
    }

    /// Drain the queue. Reentrant calls (listener callbacks fired while
    /// already draining) fall through; their operations run in the outer
    /// loop, preserving arrival order.
    fn pump(self: &Rc<Self>) {
        if self.pumping.get() {
            return;
        }
        self.pumping.set(true);
        loop {
            let op = self.queue.borrow_mut().pop_front();
            let Some(op) = op else { break };
            self.dispatch(op);
        }
        self.pumping.set(false);
    }

    fn dispatch(self: &Rc<Self>, op: Operation) {
        match op {
            Operation::Emit(event) => {
                let callback = self.state.borrow().callback.clone();
                callback(event);
                return;
            }
            Operation::IncomingAudioFrame { peer, label, bytes } => {
                let sink = self.state.borrow().audio_sink.clone();
                if let Some(sink) = sink {
                    sink(&peer, &label, bytes);
                }
                return;
            }
            _ => {}
        }

        // A fatal error leaves the engine stopped: only shutdown (and the
        // event flush above) still run.
        if self.state.borrow().stopped && !matches!(op, Operation::Shutdown) {
            return;
        }

        let mut ops = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            match op {
                Operation::Start => {
                    let listener: Rc<dyn RelayListener> =
                        Rc::new(QueueRelayListener { runtime: Rc::downgrade(self) });
                    state.on_start(&mut ops, listener);
                }
                Operation::Tick => state.on_tick(&mut ops),
                Operation::RelayEvent(event) => state.on_relay_event(&mut ops, *event),
                Operation::ConnectTransport => {
                    let listener: Rc<dyn MoqListener> =
                        Rc::new(QueueMoqListener { runtime: Rc::downgrade(self) });
                    state.on_connect_transport(&mut ops, listener);
                }
                Operation::IncomingFrame(bytes) => state.on_ingest_frame(&mut ops, bytes),
                Operation::TransportReady => state.on_transport_ready(&mut ops),
                Operation::TransportClosed => state.on_transport_closed(&mut ops),
                Operation::TransportError { message } => {
                    state.on_transport_error(&mut ops, message);
                }
                Operation::SubscribeFailed { peer, transient, message } => {
                    state.on_subscribe_failed(&mut ops, peer, transient, message);
                }
                Operation::SendMessage(content) => state.on_send_message(&mut ops, content),
                Operation::AnnounceTrack(label) => state.on_announce_track(&mut ops, label),
                Operation::RotateEpoch => state.on_rotate_epoch(&mut ops),
                Operation::InviteMember { pubkey, is_admin } => {
                    state.on_invite_member(&mut ops, pubkey, is_admin);
                }
                Operation::RemoveMember { pubkey } => state.on_remove_member(&mut ops, pubkey),
                Operation::Shutdown => state.on_shutdown(&mut ops),
                Operation::Emit(_) | Operation::IncomingAudioFrame { .. } => unreachable!(),
            }
        }
        let mut queue = self.queue.borrow_mut();
        for op in ops {
            queue.push_back(op);
        }
    }
}

/// The engine handle a host owns.
///
/// All methods are safe to call at any time; work is enqueued and runs on
/// the engine's operation queue. Query methods (`current_epoch`,
/// `group_root`, `derive_media_base_key`) read a consistent snapshot and
/// must not be called from inside the event callback.
pub struct ChatController<E: Environment> {
    runtime: Rc<RuntimeCore<E>>,
}

impl<E: Environment> ChatController<E> {
    /// Build a controller from its configuration. The handshake does not
    /// start until [`ChatController::start`].
    ///
    /// # Errors
    ///
    /// Fails on configuration problems (bad secret).
    pub fn new(config: ControllerConfig<E>) -> Result<Self, EngineError> {
        let state = ControllerState::new(config)?;
        Ok(Self {
            runtime: Rc::new(RuntimeCore {
                state: RefCell::new(state),
                queue: RefCell::new(VecDeque::new()),
                pumping: Cell::new(false),
            }),
        })
    }

    /// Begin the bootstrap handshake.
    pub fn start(&self) {
        self.runtime.enqueue(Operation::Start);
    }

    /// Advance timers (handshake heartbeat/deadline, bridge grace and
    /// retry backoff). Drivers call this at their own cadence; every
    /// timing guarantee is expressed against the Environment clock, not
    /// the call rate.
    pub fn tick(&self) {
        self.runtime.enqueue(Operation::Tick);
    }

    /// Encrypt and publish a text message; echoes a local `Message`.
    pub fn send_message(&self, content: impl Into<String>) {
        self.runtime.enqueue(Operation::SendMessage(content.into()));
    }

    /// Produce and publish a key-rotation commit.
    pub fn rotate_epoch(&self) {
        self.runtime.enqueue(Operation::RotateEpoch);
    }

    /// Announce a local audio track through the encrypted directory so
    /// peers subscribe to `<root>/audio/<self>/<label>`.
    pub fn announce_audio_track(&self, label: impl Into<String>) {
        self.runtime.enqueue(Operation::AnnounceTrack(label.into()));
    }

    /// Invite a member by pubkey (hex or bech32). Admin-only.
    pub fn invite_member(&self, pubkey: impl Into<String>, is_admin: bool) {
        self.runtime.enqueue(Operation::InviteMember { pubkey: pubkey.into(), is_admin });
    }

    /// Remove a member by pubkey. Admin-only.
    pub fn remove_member(&self, pubkey: impl Into<String>) {
        self.runtime.enqueue(Operation::RemoveMember { pubkey: pubkey.into() });
    }

    /// Close the transport and stop the engine.
    pub fn shutdown(&self) {
        self.runtime.enqueue(Operation::Shutdown);
    }

    /// The local member's pubkey.
    pub fn public_key_hex(&self) -> String {
        self.runtime.state.borrow().identity.public_key_hex()
    }

    /// Current epoch, once a group exists.
    pub fn current_epoch(&self) -> Option<u64> {
        self.runtime.state.borrow().current_epoch()
    }

    /// The stable transport root, once derived.
    pub fn group_root(&self) -> Option<String> {
        self.runtime.state.borrow().group_root.as_ref().map(|r| r.as_str().to_string())
    }

    /// Media base key for `(sender, track, current epoch)` (§media).
    ///
    /// # Errors
    ///
    /// Fails when no group exists or the exporter fails.
    pub fn derive_media_base_key(
        &self,
        sender_pubkey: &str,
        track_label: &str,
    ) -> Result<[u8; 32], EngineError> {
        let state = self.runtime.state.borrow();
        let group_id = state
            .group_id_hex
            .clone()
            .ok_or_else(|| EngineError::new(crate::error::ErrorKind::FatalConfig, "no group"))?;
        state
            .identity
            .derive_media_base_key(&group_id, sender_pubkey, track_label)
            .map_err(EngineError::from)
    }
}

struct QueueRelayListener<E: Environment> {
    runtime: Weak<RuntimeCore<E>>,
}

impl<E: Environment> RelayListener for QueueRelayListener<E> {
    fn on_event(&self, event: nostr::Event) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::RelayEvent(Box::new(event)));
        }
    }
}

struct QueueMoqListener<E: Environment> {
    runtime: Weak<RuntimeCore<E>>,
}

impl<E: Environment> MoqListener for QueueMoqListener<E> {
    fn on_ready(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::TransportReady);
        }
    }

    fn on_frame(&self, bytes: Vec<u8>) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::IncomingFrame(bytes));
        }
    }

    fn on_audio_frame(&self, peer: &str, label: &str, bytes: Vec<u8>) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::IncomingAudioFrame {
                peer: peer.to_string(),
                label: label.to_string(),
                bytes,
            });
        }
    }

    fn on_subscribe_failed(&self, peer: &str, transient: bool, message: String) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::SubscribeFailed {
                peer: peer.to_string(),
                transient,
                message,
            });
        }
    }

    fn on_error(&self, message: String) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::TransportError { message });
        }
    }

    fn on_closed(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enqueue(Operation::TransportClosed);
        }
    }
}
