//! Multi-party scenario builder.
//!
//! A [`Scenario`] owns the shared virtual clock and the two simulated
//! networks; [`Participant`]s are controllers wired to them, with every
//! emitted event (and every inbound audio frame) recorded for
//! assertions.
//!
//! Timers are driven explicitly: tests advance the clock and tick the
//! controllers in lockstep, so a whole bootstrap-and-chat run is a pure
//! function of the RNG seed.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use marmot_core::bridge::MoqService;
use marmot_core::controller::services::RelayService;
use marmot_core::controller::{
    AudioFrameSink, BootstrapRole, ChatEvent, ControllerConfig, EventCallback, MemberInfo,
};
use marmot_core::{ChatController, SessionParams};

use crate::sim_env::SimEnv;
use crate::sim_moq::{SimMoqNetwork, SimMoqService};
use crate::sim_relay::SimRelayNetwork;

/// Fixed identity secrets so pubkeys are stable across runs.
pub const CREATOR_SECRET: &str =
    "0000000000000000000000000000000000000000000000000000000000000001";
/// Invitee identity secret.
pub const INVITEE_SECRET: &str =
    "0000000000000000000000000000000000000000000000000000000000000002";
/// Third-member identity secret.
pub const THIRD_SECRET: &str =
    "9c4e9aba1e3ff5deaa1bcb2a7dce1f2f4a5c6d7e8f9a0b1c2d3e4f5061728394";

/// Derive the x-only pubkey (hex) of an identity secret.
pub fn pubkey_of(secret_hex: &str) -> String {
    let secret = nostr::SecretKey::from_hex(secret_hex).expect("valid secret");
    nostr::Keys::new(secret).public_key().to_hex()
}

/// One controller wired into the scenario networks.
pub struct Participant {
    /// The engine handle
    pub controller: ChatController<SimEnv>,
    /// Every event emitted so far, in order
    pub events: Rc<RefCell<Vec<ChatEvent>>>,
    /// Inbound encrypted audio frames `(peer, label, bytes)`
    pub audio_frames: Rc<RefCell<Vec<(String, String, Vec<u8>)>>>,
    /// This participant's MoQ endpoint, for publishing audio
    pub moq: Rc<SimMoqService>,
    /// This participant's pubkey
    pub pubkey: String,
}

impl Participant {
    /// Text messages observed, as `(author, content, local)`.
    pub fn messages(&self) -> Vec<(String, String, bool)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ChatEvent::Message { author, content, local, .. } => {
                    Some((author.clone(), content.clone(), *local))
                }
                _ => None,
            })
            .collect()
    }

    /// Bodies of messages received from peers (non-local).
    pub fn received_texts(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|(_, content, local)| (!local).then_some(content))
            .collect()
    }

    /// Highest commit counter observed.
    pub fn commit_total(&self) -> u32 {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ChatEvent::Commit { total } => Some(*total),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Latest roster snapshot.
    pub fn last_roster(&self) -> Vec<MemberInfo> {
        self.events
            .borrow()
            .iter()
            .rev()
            .find_map(|event| match event {
                ChatEvent::Roster { members } => Some(members.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Latest readiness state.
    pub fn is_ready(&self) -> bool {
        self.events
            .borrow()
            .iter()
            .rev()
            .find_map(|event| match event {
                ChatEvent::Ready { ready } => Some(*ready),
                _ => None,
            })
            .unwrap_or(false)
    }

    /// Messages of fatal errors observed.
    pub fn fatal_errors(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ChatEvent::Error { message, fatal: true, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pubkeys from `MemberJoined` events, in order.
    pub fn joined_members(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ChatEvent::MemberJoined { member } => Some(member.pubkey.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pubkeys from `MemberLeft` events, in order.
    pub fn departed_members(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ChatEvent::MemberLeft { pubkey } => Some(pubkey.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Shared world: clock, relay, MoQ.
pub struct Scenario {
    /// Virtual clock and seeded RNG
    pub env: SimEnv,
    /// Shared signalling relay
    pub relay: SimRelayNetwork,
    /// Shared MoQ relay
    pub moq: SimMoqNetwork,
    /// Bootstrap channel id
    pub session_id: String,
}

impl Scenario {
    /// Fresh world with the default seed.
    pub fn new(session_id: &str) -> Scenario {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let env = SimEnv::new();
        Scenario {
            relay: SimRelayNetwork::new(),
            moq: SimMoqNetwork::new(env.clone()),
            env,
            session_id: session_id.to_string(),
        }
    }

    /// Spawn the group creator.
    pub fn spawn_creator(&self, secret_hex: &str, peer_pubkeys: &[String]) -> Participant {
        self.spawn(BootstrapRole::Creator, secret_hex, peer_pubkeys, &[])
    }

    /// Spawn an invitee.
    pub fn spawn_invitee(
        &self,
        secret_hex: &str,
        peer_pubkeys: &[String],
        admin_pubkeys: &[String],
    ) -> Participant {
        self.spawn(BootstrapRole::Invitee, secret_hex, peer_pubkeys, admin_pubkeys)
    }

    fn spawn(
        &self,
        role: BootstrapRole,
        secret_hex: &str,
        peer_pubkeys: &[String],
        admin_pubkeys: &[String],
    ) -> Participant {
        let events = Rc::new(RefCell::new(Vec::new()));
        let recorded = events.clone();
        let callback: EventCallback = Rc::new(move |event| {
            recorded.borrow_mut().push(event);
        });

        let audio_frames = Rc::new(RefCell::new(Vec::new()));
        let recorded_audio = audio_frames.clone();
        let audio_sink: AudioFrameSink = Rc::new(move |peer: &str, label: &str, bytes| {
            recorded_audio.borrow_mut().push((peer.to_string(), label.to_string(), bytes));
        });

        let relay: Rc<dyn RelayService> = self.relay.endpoint();
        let moq_endpoint = self.moq.endpoint();
        let moq: Rc<dyn MoqService> = moq_endpoint.clone();

        let session = SessionParams {
            role,
            signalling_url: "wss://relay.sim".to_string(),
            moq_url: "https://moq.sim".to_string(),
            session_id: self.session_id.clone(),
            secret_hex: secret_hex.to_string(),
            group_id_hex: None,
            admin_pubkeys: admin_pubkeys.to_vec(),
            peer_pubkeys: peer_pubkeys.to_vec(),
        };

        let controller = ChatController::new(ControllerConfig {
            env: self.env.clone(),
            session,
            relay,
            moq,
            callback,
            audio_sink: Some(audio_sink),
        })
        .expect("controller construction");

        Participant {
            controller,
            events,
            audio_frames,
            moq: moq_endpoint,
            pubkey: pubkey_of(secret_hex),
        }
    }

    /// Advance the clock in `step` increments, ticking every participant
    /// each time.
    pub fn settle(&self, participants: &[&Participant], steps: u32, step: Duration) {
        for _ in 0..steps {
            self.env.advance(step);
            for participant in participants {
                participant.controller.tick();
            }
        }
    }

    /// Standard two-party bootstrap: start both and settle until the
    /// handshake and transport come up.
    pub fn bootstrap(&self, creator: &Participant, invitee: &Participant) {
        creator.controller.start();
        invitee.controller.start();
        self.settle(&[creator, invitee], 20, Duration::from_millis(500));
    }
}
