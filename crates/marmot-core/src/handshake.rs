//! Bootstrap handshake state machine.
//!
//! Gets a creator and an invitee from "nothing" to "both hold the same
//! group identifier" over a relay that provides unordered, deduplicated,
//! signed broadcast on a topic.
//!
//! # Architecture: Action-Based State Machine
//!
//! The machine holds no sockets and signs nothing. Inputs are opened
//! envelopes and clock ticks; outputs are [`HandshakeAction`]s the
//! controller executes (publish an envelope, hand an artifact to the MLS
//! handle). Time is passed as a parameter, never read.
//!
//! ```text
//! creator:  WaitingForKeyPackage ──offer──> Established
//! invitee:  WaitingForWelcome ──welcome──> Established
//! ```
//!
//! # Idempotency
//!
//! Envelopes are deduplicated by event id. Re-published offers and
//! welcomes are safe at any cadence: the creator answers repeated
//! `request-welcome` until it observes application traffic from the
//! invitee, and the invitee ignores welcomes once established. A stale
//! welcome rejection re-arms the invitee's heartbeat.

use std::collections::BTreeSet;
use std::time::Duration;

use marmot_proto::envelope::{BootstrapRole, HandshakeEnvelope, HandshakePayload};

use crate::controller::events::HandshakePhase;

/// Handshake timing knobs.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Invitee republish cadence for offer + welcome request
    pub heartbeat_interval: Duration,
    /// Overall wall-clock bound for the whole bootstrap
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Internal machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    WaitingForKeyPackage,
    WaitingForWelcome,
    Established,
}

/// Actions the controller executes on the machine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Publish (or re-publish) the cached key-package offer
    PublishKeyPackageOffer,
    /// Publish a `request-welcome` heartbeat
    PublishWelcomeRequest,
    /// Publish a `request-key-package`, optionally directed
    PublishKeyPackageRequest {
        /// Target member, when inviting someone specific
        target: Option<String>,
    },
    /// Re-send the cached welcome in response to a `request-welcome`
    AnswerWelcome {
        /// Requesting member, when known
        target: Option<String>,
    },
    /// A key-package offer arrived; hand it to the MLS handle
    AcceptKeyPackage {
        /// Signed offer event JSON
        event_json: String,
        /// Re-importable bundle, when the peer included one
        bundle: Option<String>,
        /// Offering member's pubkey, when included
        pubkey: Option<String>,
    },
    /// A welcome arrived; hand it to the MLS handle
    AcceptWelcome {
        /// Serialized welcome (base64)
        welcome_b64: String,
        /// Group id the sender claims, for cross-checking
        group_id_hex: Option<String>,
        /// Transport root carried alongside the welcome
        moq_root: Option<String>,
    },
    /// The handshake moved to a new user-visible phase
    PhaseChanged(HandshakePhase),
    /// The overall deadline passed without establishing a group
    TimedOut,
}

/// The bootstrap handshake state machine for one session.
pub struct HandshakeMachine<I> {
    role: BootstrapRole,
    own_pubkey: String,
    state: HandshakeState,
    config: HandshakeConfig,
    started_at: I,
    last_heartbeat: Option<I>,
    seen: BTreeSet<String>,
    peer_traffic_seen: bool,
    timed_out: bool,
}

impl<I: Copy + Ord + std::ops::Sub<Output = Duration>> HandshakeMachine<I> {
    /// Create a machine for the given role, clock-started at `now`.
    pub fn new(role: BootstrapRole, own_pubkey: String, config: HandshakeConfig, now: I) -> Self {
        let state = match role {
            BootstrapRole::Creator => HandshakeState::WaitingForKeyPackage,
            BootstrapRole::Invitee => HandshakeState::WaitingForWelcome,
        };
        Self {
            role,
            own_pubkey,
            state,
            config,
            started_at: now,
            last_heartbeat: None,
            seen: BTreeSet::new(),
            peer_traffic_seen: false,
            timed_out: false,
        }
    }

    /// Kick off the handshake. The creator solicits a key package; the
    /// invitee publishes its offer and starts heartbeating.
    pub fn start(&mut self, now: I) -> Vec<HandshakeAction> {
        let mut actions = vec![HandshakeAction::PhaseChanged(self.phase())];
        match self.role {
            BootstrapRole::Creator => {
                actions.push(HandshakeAction::PublishKeyPackageRequest { target: None });
            }
            BootstrapRole::Invitee => {
                self.last_heartbeat = Some(now);
                actions.push(HandshakeAction::PublishKeyPackageOffer);
                actions.push(HandshakeAction::PublishWelcomeRequest);
            }
        }
        actions
    }

    /// Feed one opened envelope, deduplicated by relay event id.
    pub fn on_envelope(
        &mut self,
        event_id_hex: &str,
        envelope: &HandshakeEnvelope,
    ) -> Vec<HandshakeAction> {
        if !self.seen.insert(event_id_hex.to_string()) {
            return Vec::new();
        }
        if envelope.from == self.role {
            return Vec::new();
        }

        match (self.role, &envelope.payload) {
            (BootstrapRole::Creator, HandshakePayload::KeyPackage { event, bundle, pubkey }) => {
                vec![HandshakeAction::AcceptKeyPackage {
                    event_json: event.clone(),
                    bundle: bundle.clone(),
                    pubkey: pubkey.clone(),
                }]
            }
            (BootstrapRole::Creator, HandshakePayload::RequestWelcome { pubkey }) => {
                if self.state == HandshakeState::Established && self.peer_traffic_seen {
                    Vec::new()
                } else {
                    vec![HandshakeAction::AnswerWelcome { target: pubkey.clone() }]
                }
            }
            (
                BootstrapRole::Invitee,
                HandshakePayload::Welcome { welcome, group_id_hex, moq_root, recipient },
            ) => {
                if recipient.as_deref().is_some_and(|r| r != self.own_pubkey) {
                    return Vec::new();
                }
                if self.state == HandshakeState::Established {
                    return Vec::new();
                }
                vec![HandshakeAction::AcceptWelcome {
                    welcome_b64: welcome.clone(),
                    group_id_hex: group_id_hex.clone(),
                    moq_root: moq_root.clone(),
                }]
            }
            (BootstrapRole::Invitee, HandshakePayload::RequestKeyPackage { pubkey }) => {
                if pubkey.as_deref().is_some_and(|p| p != self.own_pubkey) {
                    return Vec::new();
                }
                vec![HandshakeAction::PublishKeyPackageOffer]
            }
            _ => Vec::new(),
        }
    }

    /// Advance timers: heartbeats while waiting, the overall deadline
    /// until established.
    pub fn tick(&mut self, now: I) -> Vec<HandshakeAction> {
        if self.state == HandshakeState::Established || self.timed_out {
            return Vec::new();
        }
        if now - self.started_at >= self.config.timeout {
            self.timed_out = true;
            return vec![HandshakeAction::TimedOut];
        }
        if self.role == BootstrapRole::Invitee {
            let due = match self.last_heartbeat {
                None => true,
                Some(last) => now - last >= self.config.heartbeat_interval,
            };
            if due {
                self.last_heartbeat = Some(now);
                return vec![
                    HandshakeAction::PublishKeyPackageOffer,
                    HandshakeAction::PublishWelcomeRequest,
                ];
            }
        }
        Vec::new()
    }

    /// Mark the group as established (welcome accepted / group created).
    pub fn established(&mut self) -> Vec<HandshakeAction> {
        self.state = HandshakeState::Established;
        vec![HandshakeAction::PhaseChanged(HandshakePhase::Finalizing)]
    }

    /// A welcome turned out stale; fall back to waiting and re-arm the
    /// heartbeat so the next tick republishes immediately.
    pub fn welcome_rejected(&mut self) {
        if self.role == BootstrapRole::Invitee {
            self.state = HandshakeState::WaitingForWelcome;
            self.last_heartbeat = None;
        }
    }

    /// Record that application traffic from the peer was observed; the
    /// creator stops re-answering `request-welcome`.
    pub fn note_peer_traffic(&mut self) {
        self.peer_traffic_seen = true;
    }

    /// Whether both sides hold the group.
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// User-visible phase for `Handshake` events.
    pub fn phase(&self) -> HandshakePhase {
        match self.state {
            HandshakeState::WaitingForKeyPackage => HandshakePhase::WaitingForKeyPackage,
            HandshakeState::WaitingForWelcome => HandshakePhase::WaitingForWelcome,
            HandshakeState::Established => HandshakePhase::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct T(u64);

    impl std::ops::Sub for T {
        type Output = Duration;

        fn sub(self, rhs: T) -> Duration {
            Duration::from_secs(self.0 - rhs.0)
        }
    }

    fn offer_envelope(session: &str) -> HandshakeEnvelope {
        HandshakeEnvelope {
            session: session.to_string(),
            from: BootstrapRole::Invitee,
            created_at: 1,
            payload: HandshakePayload::KeyPackage {
                event: "{}".to_string(),
                bundle: None,
                pubkey: Some("bb".repeat(32)),
            },
        }
    }

    #[test]
    fn duplicate_event_ids_produce_one_transition() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Creator,
            "aa".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));

        let envelope = offer_envelope("s");
        let first = machine.on_envelope("event-1", &envelope);
        assert!(matches!(first[0], HandshakeAction::AcceptKeyPackage { .. }));
        assert!(machine.on_envelope("event-1", &envelope).is_empty());
    }

    #[test]
    fn own_role_events_ignored() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Invitee,
            "bb".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));
        // An invitee's own offer echoed back by the relay.
        assert!(machine.on_envelope("echo", &offer_envelope("s")).is_empty());
    }

    #[test]
    fn invitee_heartbeats_until_established() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Invitee,
            "bb".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));

        assert!(machine.tick(T(1)).is_empty());
        let beat = machine.tick(T(2));
        assert_eq!(
            beat,
            vec![
                HandshakeAction::PublishKeyPackageOffer,
                HandshakeAction::PublishWelcomeRequest
            ]
        );

        machine.established();
        assert!(machine.tick(T(4)).is_empty());
    }

    #[test]
    fn stale_welcome_rearms_heartbeat() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Invitee,
            "bb".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));
        machine.tick(T(2));

        machine.welcome_rejected();
        // Immediately due again, regardless of cadence.
        assert!(!machine.tick(T(2)).is_empty());
    }

    #[test]
    fn timeout_fires_once() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Creator,
            "aa".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));
        assert!(machine.tick(T(59)).is_empty());
        assert_eq!(machine.tick(T(60)), vec![HandshakeAction::TimedOut]);
        assert!(machine.tick(T(61)).is_empty());
    }

    #[test]
    fn creator_answers_welcome_requests_until_peer_traffic() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Creator,
            "aa".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));
        machine.established();

        let request = HandshakeEnvelope {
            session: "s".to_string(),
            from: BootstrapRole::Invitee,
            created_at: 3,
            payload: HandshakePayload::RequestWelcome { pubkey: Some("bb".repeat(32)) },
        };
        let answer = machine.on_envelope("req-1", &request);
        assert!(matches!(answer[0], HandshakeAction::AnswerWelcome { .. }));

        machine.note_peer_traffic();
        assert!(machine.on_envelope("req-2", &request).is_empty());
    }

    #[test]
    fn directed_requests_filter_by_target() {
        let mut machine = HandshakeMachine::new(
            BootstrapRole::Invitee,
            "bb".repeat(32),
            HandshakeConfig::default(),
            T(0),
        );
        machine.start(T(0));

        let for_other = HandshakeEnvelope {
            session: "s".to_string(),
            from: BootstrapRole::Creator,
            created_at: 1,
            payload: HandshakePayload::RequestKeyPackage { pubkey: Some("cc".repeat(32)) },
        };
        assert!(machine.on_envelope("other", &for_other).is_empty());

        let for_us = HandshakeEnvelope {
            payload: HandshakePayload::RequestKeyPackage { pubkey: Some("bb".repeat(32)) },
            ..for_other
        };
        assert_eq!(
            machine.on_envelope("us", &for_us),
            vec![HandshakeAction::PublishKeyPackageOffer]
        );
    }
}
