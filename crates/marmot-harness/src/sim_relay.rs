//! In-memory signalling relay.
//!
//! Models the relay contract the engine assumes: unordered, deduplicated,
//! signed broadcast on a topic, with a bounded backlog replayed to late
//! subscribers. Signature verification happens here the way a real relay
//! rejects mis-signed events; the engine verifies again on receipt.
//!
//! Deterministic fault injection: [`SimRelayNetwork::drop_next_publishes`]
//! silently discards the next N publishes, which is how the handshake
//! retry tests exercise the heartbeat path.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use marmot_core::controller::services::{RelayConnectParams, RelayListener, RelayService};
use nostr::Event;

const BACKLOG_LIMIT: usize = 50;

struct RelayNetworkInner {
    subscribers: RefCell<HashMap<String, Vec<Rc<dyn RelayListener>>>>,
    backlog: RefCell<HashMap<String, VecDeque<Event>>>,
    seen_ids: RefCell<BTreeSet<String>>,
    drop_budget: RefCell<u32>,
}

/// A shared in-memory relay; every endpoint connected to the same
/// network sees the same topics.
#[derive(Clone)]
pub struct SimRelayNetwork {
    inner: Rc<RelayNetworkInner>,
}

impl SimRelayNetwork {
    /// Fresh empty network.
    pub fn new() -> SimRelayNetwork {
        SimRelayNetwork {
            inner: Rc::new(RelayNetworkInner {
                subscribers: RefCell::new(HashMap::new()),
                backlog: RefCell::new(HashMap::new()),
                seen_ids: RefCell::new(BTreeSet::new()),
                drop_budget: RefCell::new(0),
            }),
        }
    }

    /// Create an endpoint service for one participant.
    pub fn endpoint(&self) -> Rc<SimRelayService> {
        Rc::new(SimRelayService { network: self.clone() })
    }

    /// Silently discard the next `n` published events.
    pub fn drop_next_publishes(&self, n: u32) {
        *self.inner.drop_budget.borrow_mut() += n;
    }

    /// Number of distinct events the relay has accepted.
    pub fn accepted_events(&self) -> usize {
        self.inner.seen_ids.borrow().len()
    }

    fn publish(&self, event: Event) {
        {
            let mut budget = self.inner.drop_budget.borrow_mut();
            if *budget > 0 {
                *budget -= 1;
                tracing::debug!("sim relay dropped a publish (fault injection)");
                return;
            }
        }
        if event.verify().is_err() {
            tracing::warn!("sim relay rejected mis-signed event");
            return;
        }
        // Relay-side dedup by event id.
        if !self.inner.seen_ids.borrow_mut().insert(event.id.to_hex()) {
            return;
        }
        let Some(topic) = session_topic(&event) else {
            return;
        };

        {
            let mut backlog = self.inner.backlog.borrow_mut();
            let entries = backlog.entry(topic.clone()).or_default();
            entries.push_back(event.clone());
            while entries.len() > BACKLOG_LIMIT {
                entries.pop_front();
            }
        }

        let listeners: Vec<Rc<dyn RelayListener>> = self
            .inner
            .subscribers
            .borrow()
            .get(&topic)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    fn subscribe(&self, topic: String, listener: Rc<dyn RelayListener>) {
        let replay: Vec<Event> = self
            .inner
            .backlog
            .borrow()
            .get(&topic)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default();
        self.inner.subscribers.borrow_mut().entry(topic).or_default().push(listener.clone());
        for event in replay {
            listener.on_event(event);
        }
    }
}

impl Default for SimRelayNetwork {
    fn default() -> Self {
        SimRelayNetwork::new()
    }
}

/// One participant's connection to the [`SimRelayNetwork`].
pub struct SimRelayService {
    network: SimRelayNetwork,
}

impl RelayService for SimRelayService {
    fn connect(&self, params: RelayConnectParams, listener: Rc<dyn RelayListener>) {
        self.network.subscribe(params.session_id, listener);
    }

    fn publish(&self, event: Event) {
        self.network.publish(event);
    }

    fn shutdown(&self) {}
}

fn session_topic(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        if parts.first().map(String::as_str) == Some("t") {
            parts.get(1).cloned()
        } else {
            None
        }
    })
}
