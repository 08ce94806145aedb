//! In-memory MoQ relay.
//!
//! Models the transport contract of the bridge: named single-writer
//! tracks, arrival-order delivery per track, backlog replay on late
//! subscribe, and no cross-track ordering. Capability tokens are
//! verified on connect the way a relay's auth gate would.
//!
//! Test hooks:
//!
//! - [`SimMoqNetwork::hold_track`] parks deliveries for one track so a
//!   test can release them out of order ([`SimMoqNetwork::release_held`]).
//!   The pending-frame tests use this to produce a future-epoch wrapper
//!   ahead of its commit.
//! - [`SimMoqNetwork::fail_next_subscribes`] makes upcoming subscribe
//!   attempts fail transiently to exercise the backoff path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use marmot_core::bridge::{MoqConnectParams, MoqListener, MoqService};
use marmot_core::Environment;
use marmot_proto::auth::{CapabilityClaims, MoqAuth};
use marmot_proto::paths::{GroupRoot, TrackPath};

use crate::sim_env::SimEnv;

#[derive(Clone)]
enum Subscriber {
    Wrappers { listener: Rc<dyn MoqListener> },
    Audio { listener: Rc<dyn MoqListener>, peer: String, label: String },
}

struct MoqNetworkInner {
    tracks: RefCell<HashMap<String, Vec<Vec<u8>>>>,
    subscribers: RefCell<HashMap<String, Vec<Subscriber>>>,
    held: RefCell<HashMap<String, Vec<Vec<u8>>>>,
    failing_subscribes: RefCell<u32>,
}

/// A shared in-memory MoQ relay.
#[derive(Clone)]
pub struct SimMoqNetwork {
    env: SimEnv,
    inner: Rc<MoqNetworkInner>,
}

impl SimMoqNetwork {
    /// Fresh empty relay sharing the scenario clock (for capability
    /// expiry checks).
    pub fn new(env: SimEnv) -> SimMoqNetwork {
        SimMoqNetwork {
            env,
            inner: Rc::new(MoqNetworkInner {
                tracks: RefCell::new(HashMap::new()),
                subscribers: RefCell::new(HashMap::new()),
                held: RefCell::new(HashMap::new()),
                failing_subscribes: RefCell::new(0),
            }),
        }
    }

    /// Create an endpoint service for one participant.
    pub fn endpoint(&self) -> Rc<SimMoqService> {
        Rc::new(SimMoqService { network: self.clone(), endpoint: RefCell::new(None) })
    }

    /// Park deliveries on `track` until [`SimMoqNetwork::release_held`].
    pub fn hold_track(&self, track: &str) {
        self.inner.held.borrow_mut().entry(track.to_string()).or_default();
    }

    /// Deliver the held frames of `track` in the given index order and
    /// stop holding it.
    pub fn release_held(&self, track: &str, order: &[usize]) {
        let frames = self.inner.held.borrow_mut().remove(track).unwrap_or_default();
        for &index in order {
            if let Some(bytes) = frames.get(index) {
                self.deliver(track, bytes.clone());
            }
        }
    }

    /// Make the next `n` subscribe attempts fail transiently.
    pub fn fail_next_subscribes(&self, n: u32) {
        *self.inner.failing_subscribes.borrow_mut() += n;
    }

    /// Frames currently stored on a track.
    pub fn track_len(&self, track: &str) -> usize {
        self.inner.tracks.borrow().get(track).map(Vec::len).unwrap_or(0)
    }

    fn publish(&self, track: String, bytes: Vec<u8>) {
        self.inner.tracks.borrow_mut().entry(track.clone()).or_default().push(bytes.clone());
        if let Some(held) = self.inner.held.borrow_mut().get_mut(&track) {
            held.push(bytes);
            return;
        }
        self.deliver(&track, bytes);
    }

    fn deliver(&self, track: &str, bytes: Vec<u8>) {
        // Clone the fan-out list first: a delivery can re-enter
        // `subscribe` (a replayed commit makes the receiver subscribe to
        // a new member).
        let subs: Vec<Subscriber> = self
            .inner
            .subscribers
            .borrow()
            .get(track)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();
        for sub in &subs {
            match sub {
                Subscriber::Wrappers { listener } => listener.on_frame(bytes.clone()),
                Subscriber::Audio { listener, peer, label } => {
                    listener.on_audio_frame(peer, label, bytes.clone());
                }
            }
        }
    }

    fn subscribe(&self, track: String, subscriber: Subscriber, listener: &Rc<dyn MoqListener>, peer: &str) {
        {
            let mut failing = self.inner.failing_subscribes.borrow_mut();
            if *failing > 0 {
                *failing -= 1;
                listener.on_subscribe_failed(peer, true, "reset-stream".to_string());
                return;
            }
        }
        // Replay backlog in arrival order, skipping frames still held.
        let replay: Vec<Vec<u8>> = if self.inner.held.borrow().contains_key(&track) {
            Vec::new()
        } else {
            self.inner.tracks.borrow().get(&track).cloned().unwrap_or_default()
        };
        for bytes in &replay {
            match &subscriber {
                Subscriber::Wrappers { listener } => listener.on_frame(bytes.clone()),
                Subscriber::Audio { listener, peer, label } => {
                    listener.on_audio_frame(peer, label, bytes.clone());
                }
            }
        }
        self.inner.subscribers.borrow_mut().entry(track).or_default().push(subscriber);
    }
}

struct EndpointState {
    root: GroupRoot,
    own_pubkey: String,
    listener: Rc<dyn MoqListener>,
}

/// One participant's session on the [`SimMoqNetwork`].
pub struct SimMoqService {
    network: SimMoqNetwork,
    endpoint: RefCell<Option<EndpointState>>,
}

impl MoqService for SimMoqService {
    fn connect(&self, params: MoqConnectParams, listener: Rc<dyn MoqListener>) {
        // Auth gate: a self-issued capability must verify and cover the
        // endpoint's own publish paths.
        if let Some(MoqAuth::Capability(token)) = &params.auth {
            let now = self.network.env.unix_now();
            match CapabilityClaims::verify(token, now) {
                Ok(claims) => {
                    let own_wrappers =
                        format!("{}/wrappers/{}", params.root.as_str(), params.own_pubkey);
                    if !claims.allows_put(&own_wrappers) {
                        listener.on_error("capability denies publish".to_string());
                        return;
                    }
                }
                Err(e) => {
                    listener.on_error(format!("capability rejected: {e}"));
                    return;
                }
            }
        }

        *self.endpoint.borrow_mut() = Some(EndpointState {
            root: params.root,
            own_pubkey: params.own_pubkey,
            listener: listener.clone(),
        });
        listener.on_ready();
    }

    fn publish(&self, bytes: &[u8]) {
        let Some((root, own)) = self.root_and_owner() else {
            return;
        };
        let Ok(path) = TrackPath::wrappers(root, &own) else {
            return;
        };
        self.network.publish(path.to_string(), bytes.to_vec());
    }

    fn publish_audio(&self, label: &str, bytes: &[u8]) {
        let Some((root, own)) = self.root_and_owner() else {
            return;
        };
        let Ok(path) = TrackPath::audio(root, &own, label) else {
            return;
        };
        self.network.publish(path.to_string(), bytes.to_vec());
    }

    fn subscribe_peer(&self, peer: &str) {
        let Some(state) = &*self.endpoint.borrow() else {
            return;
        };
        let Ok(path) = TrackPath::wrappers(state.root.clone(), peer) else {
            return;
        };
        self.network.subscribe(
            path.to_string(),
            Subscriber::Wrappers { listener: state.listener.clone() },
            &state.listener,
            peer,
        );
    }

    fn subscribe_peer_audio(&self, peer: &str, label: &str) {
        let Some(state) = &*self.endpoint.borrow() else {
            return;
        };
        let Ok(path) = TrackPath::audio(state.root.clone(), peer, label) else {
            return;
        };
        self.network.subscribe(
            path.to_string(),
            Subscriber::Audio {
                listener: state.listener.clone(),
                peer: peer.to_string(),
                label: label.to_string(),
            },
            &state.listener,
            peer,
        );
    }

    fn close(&self) {
        if let Some(state) = self.endpoint.borrow_mut().take() {
            state.listener.on_closed();
        }
    }
}

impl SimMoqService {
    fn root_and_owner(&self) -> Option<(GroupRoot, String)> {
        self.endpoint
            .borrow()
            .as_ref()
            .map(|state| (state.root.clone(), state.own_pubkey.clone()))
    }
}
