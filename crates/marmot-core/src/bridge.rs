//! MoQ transport bridge.
//!
//! Carries opaque byte frames between members, content-blind. The bridge
//! splits in two:
//!
//! - [`MoqService`]/[`MoqListener`]: the service seam a driver implements
//!   (WebTransport in production, an in-memory relay in the harness).
//! - [`TransportBridge`]: engine-owned state (the bounded publish queue,
//!   readiness, the subscription set, per-peer retry backoff). Like
//!   every other state machine here it returns [`BridgeAction`]s instead
//!   of performing I/O.
//!
//! # Ordering
//!
//! Arrival order on a single track is preserved by the driver contract.
//! Cross-track ordering is not guaranteed and not relied upon: MLS orders
//! itself via epochs, audio uses explicit frame counters.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use marmot_proto::auth::MoqAuth;
use marmot_proto::paths::GroupRoot;

/// Parameters for opening a MoQ session.
#[derive(Debug, Clone)]
pub struct MoqConnectParams {
    /// Relay URL
    pub url: String,
    /// Group namespace all tracks live under
    pub root: GroupRoot,
    /// Local member pubkey (names the publish tracks)
    pub own_pubkey: String,
    /// Peers to subscribe to immediately
    pub peer_pubkeys: Vec<String>,
    /// Authorization carried as URL query parameters
    pub auth: Option<MoqAuth>,
}

/// Callbacks a MoQ driver delivers back into the engine.
///
/// Implementations enqueue operations; they never touch engine state
/// directly.
pub trait MoqListener {
    /// The local publish track was accepted by the relay.
    fn on_ready(&self);
    /// A wrapper frame arrived on some subscribed wrappers track.
    fn on_frame(&self, bytes: Vec<u8>);
    /// An audio frame arrived on a subscribed audio track.
    fn on_audio_frame(&self, peer: &str, label: &str, bytes: Vec<u8>);
    /// A subscription attempt failed.
    fn on_subscribe_failed(&self, peer: &str, transient: bool, message: String);
    /// The session failed.
    fn on_error(&self, message: String);
    /// The session closed.
    fn on_closed(&self);
}

/// The service seam to a MoQ driver. All methods are fire-and-forget;
/// results come back through the listener.
pub trait MoqService {
    /// Open the session and the local publish tracks.
    fn connect(&self, params: MoqConnectParams, listener: Rc<dyn MoqListener>);
    /// Append a frame to the local wrappers track.
    fn publish(&self, bytes: &[u8]);
    /// Append a frame to a local audio track.
    fn publish_audio(&self, label: &str, bytes: &[u8]);
    /// Open (idempotently) a subscription to a peer's wrappers track.
    fn subscribe_peer(&self, peer: &str);
    /// Open (idempotently) a subscription to a peer's audio track.
    fn subscribe_peer_audio(&self, peer: &str, label: &str);
    /// Flush and close the session.
    fn close(&self);
}

/// Bridge timing and capacity knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Publish queue bound; overflow drops the oldest frame
    pub queue_capacity: usize,
    /// Report ready this long after connect even without relay accept
    pub ready_grace: Duration,
    /// First retry delay after a transient subscribe failure
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_cap: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ready_grace: Duration::from_millis(750),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

/// Actions the controller executes against the [`MoqService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Publish these wrapper bytes now
    Publish(Vec<u8>),
    /// Open a wrappers subscription to this peer
    Subscribe(String),
    /// The bridge became ready (emit `Ready` to the host)
    Ready,
}

struct RetryState<I> {
    /// Failures so far; sets the next delay
    failures: u32,
    /// When the last failure happened
    failed_at: I,
    /// A retry was issued and has neither failed nor been cleared yet
    inflight: bool,
}

/// Engine-owned transport bridge state.
pub struct TransportBridge<I> {
    config: BridgeConfig,
    ready: bool,
    connected_at: Option<I>,
    queue: VecDeque<Vec<u8>>,
    subscribed: BTreeSet<String>,
    retry: BTreeMap<String, RetryState<I>>,
    cursors: BTreeMap<String, u64>,
}

impl<I: Copy + Ord + std::ops::Sub<Output = Duration>> TransportBridge<I> {
    /// New bridge with the given knobs.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            ready: false,
            connected_at: None,
            queue: VecDeque::new(),
            subscribed: BTreeSet::new(),
            retry: BTreeMap::new(),
            cursors: BTreeMap::new(),
        }
    }

    /// Record that the session was opened; starts the readiness grace
    /// timer so a solo participant can still send.
    pub fn connected(&mut self, now: I) {
        self.connected_at = Some(now);
    }

    /// Whether publishes flow immediately.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether the session was opened.
    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    /// Current subscription intent set.
    pub fn subscribed_peers(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    /// Publish now, or queue until ready. Overflow drops the oldest
    /// frame with a warning.
    pub fn publish_or_queue(&mut self, bytes: Vec<u8>) -> Vec<BridgeAction> {
        if self.ready {
            return vec![BridgeAction::Publish(bytes)];
        }
        if self.queue.len() >= self.config.queue_capacity {
            let dropped = self.queue.pop_front();
            tracing::warn!(
                dropped_len = dropped.map(|d| d.len()).unwrap_or(0),
                queued = self.queue.len(),
                "publish queue full, dropping oldest frame"
            );
        }
        self.queue.push_back(bytes);
        Vec::new()
    }

    /// Relay accepted the publish track.
    pub fn on_ready(&mut self) -> Vec<BridgeAction> {
        self.mark_ready()
    }

    /// Advance timers: readiness grace and subscription retries.
    pub fn tick(&mut self, now: I) -> Vec<BridgeAction> {
        let mut actions = Vec::new();
        if !self.ready {
            if let Some(connected_at) = self.connected_at {
                if now - connected_at >= self.config.ready_grace {
                    actions.extend(self.mark_ready());
                }
            }
        }

        let due: Vec<String> = self
            .retry
            .iter()
            .filter(|(_, state)| {
                !state.inflight && now - state.failed_at >= self.backoff_delay(state.failures)
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in due {
            if let Some(state) = self.retry.get_mut(&peer) {
                state.inflight = true;
            }
            self.subscribed.insert(peer.clone());
            actions.push(BridgeAction::Subscribe(peer));
        }
        actions
    }

    /// Subscribe to a peer's wrappers track unless already subscribed.
    pub fn ensure_subscribed(&mut self, peer: &str) -> Vec<BridgeAction> {
        if self.subscribed.insert(peer.to_string()) {
            vec![BridgeAction::Subscribe(peer.to_string())]
        } else {
            Vec::new()
        }
    }

    /// Whether a peer is in the subscription set.
    pub fn is_subscribed(&self, peer: &str) -> bool {
        self.subscribed.contains(peer)
    }

    /// A subscription attempt failed. Transient failures re-enter the
    /// backoff schedule; fatal ones just drop out of the set.
    pub fn subscribe_failed(&mut self, peer: &str, transient: bool, now: I) {
        self.subscribed.remove(peer);
        if transient {
            let state = self.retry.entry(peer.to_string()).or_insert(RetryState {
                failures: 0,
                failed_at: now,
                inflight: false,
            });
            state.failures = state.failures.saturating_add(1);
            state.failed_at = now;
            state.inflight = false;
        } else {
            self.retry.remove(peer);
        }
    }

    /// A subscription delivered a frame; clear its backoff state.
    pub fn subscribe_succeeded(&mut self, peer: &str) {
        self.retry.remove(peer);
    }

    /// Record the last observed group sequence for a track (resume
    /// cursor; the host may persist these).
    pub fn record_cursor(&mut self, track: &str, group_seq: u64) {
        self.cursors.insert(track.to_string(), group_seq);
    }

    /// Last observed group sequence for a track, if any.
    pub fn resume_cursor(&self, track: &str) -> Option<u64> {
        self.cursors.get(track).copied()
    }

    fn mark_ready(&mut self) -> Vec<BridgeAction> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        let mut actions = vec![BridgeAction::Ready];
        actions.extend(self.queue.drain(..).map(BridgeAction::Publish));
        actions
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        (self.config.backoff_base * factor).min(self.config.backoff_cap)
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
            Duration::from_millis(self.0 - rhs.0)
        }
    }

    fn bridge() -> TransportBridge<T> {
        TransportBridge::new(BridgeConfig {
            queue_capacity: 3,
            ready_grace: Duration::from_millis(750),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
        })
    }

    #[test]
    fn frames_queue_until_ready_then_flush_in_order() {
        let mut bridge = bridge();
        bridge.connected(T(0));

        assert!(bridge.publish_or_queue(vec![1]).is_empty());
        assert!(bridge.publish_or_queue(vec![2]).is_empty());

        let actions = bridge.on_ready();
        assert_eq!(
            actions,
            vec![
                BridgeAction::Ready,
                BridgeAction::Publish(vec![1]),
                BridgeAction::Publish(vec![2]),
            ]
        );
        assert_eq!(bridge.publish_or_queue(vec![3]), vec![BridgeAction::Publish(vec![3])]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut bridge = bridge();
        for i in 0..4u8 {
            bridge.publish_or_queue(vec![i]);
        }
        let actions = bridge.on_ready();
        // Frame 0 was evicted.
        assert_eq!(
            actions,
            vec![
                BridgeAction::Ready,
                BridgeAction::Publish(vec![1]),
                BridgeAction::Publish(vec![2]),
                BridgeAction::Publish(vec![3]),
            ]
        );
    }

    #[test]
    fn grace_timer_reports_ready_without_relay_accept() {
        let mut bridge = bridge();
        bridge.connected(T(0));
        assert!(bridge.tick(T(500)).is_empty());
        let actions = bridge.tick(T(750));
        assert_eq!(actions, vec![BridgeAction::Ready]);
        // Ready only fires once.
        assert!(bridge.on_ready().is_empty());
    }

    #[test]
    fn subscriptions_are_idempotent() {
        let mut bridge = bridge();
        let peer = "cc".repeat(32);
        assert_eq!(bridge.ensure_subscribed(&peer), vec![BridgeAction::Subscribe(peer.clone())]);
        assert!(bridge.ensure_subscribed(&peer).is_empty());
        assert!(bridge.is_subscribed(&peer));
    }

    #[test]
    fn transient_subscribe_failure_backs_off_exponentially() {
        let mut bridge = bridge();
        let peer = "cc".repeat(32);
        bridge.ensure_subscribed(&peer);
        bridge.subscribe_failed(&peer, true, T(0));
        assert!(!bridge.is_subscribed(&peer));

        // First retry after the base delay.
        assert!(bridge.tick(T(999)).is_empty());
        assert_eq!(bridge.tick(T(1000)), vec![BridgeAction::Subscribe(peer.clone())]);

        // Second failure doubles the delay.
        bridge.subscribe_failed(&peer, true, T(1000));
        assert!(bridge.tick(T(2999)).is_empty());
        assert_eq!(bridge.tick(T(3000)), vec![BridgeAction::Subscribe(peer.clone())]);

        // Success clears the schedule.
        bridge.subscribe_succeeded(&peer);
        assert!(bridge.tick(T(60_000)).is_empty());
    }

    #[test]
    fn fatal_subscribe_failure_does_not_retry() {
        let mut bridge = bridge();
        let peer = "cc".repeat(32);
        bridge.ensure_subscribed(&peer);
        bridge.subscribe_failed(&peer, false, T(0));
        assert!(bridge.tick(T(60_000)).is_empty());
    }

    #[test]
    fn resume_cursors_track_latest_group_seq() {
        let mut bridge = bridge();
        bridge.record_cursor("marmot/aa/wrappers/bb", 4);
        bridge.record_cursor("marmot/aa/wrappers/bb", 7);
        assert_eq!(bridge.resume_cursor("marmot/aa/wrappers/bb"), Some(7));
        assert_eq!(bridge.resume_cursor("marmot/aa/wrappers/cc"), None);
    }
}
