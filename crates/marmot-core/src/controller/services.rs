//! Service seams between the engine and its drivers.
//!
//! The engine signs, parses, and verifies everything itself; drivers only
//! move bytes. Both traits are fire-and-forget; results come back as
//! listener callbacks, which enqueue operations on the controller queue.
//!
//! The MoQ seam lives in [`crate::bridge`]; this module holds the
//! signalling-relay seam.

use std::rc::Rc;

use nostr::Event;

/// Parameters for opening the relay subscription.
#[derive(Debug, Clone)]
pub struct RelayConnectParams {
    /// Relay URL
    pub url: String,
    /// Bootstrap channel to filter on (`#t` tag)
    pub session_id: String,
}

/// Callbacks a relay driver delivers back into the engine.
pub trait RelayListener {
    /// A (possibly duplicate, possibly foreign) event matching the
    /// subscription arrived. The engine verifies and deduplicates.
    fn on_event(&self, event: Event);
}

/// The service seam to a signalling-relay driver.
pub trait RelayService {
    /// Open the connection and subscribe to the session topic.
    fn connect(&self, params: RelayConnectParams, listener: Rc<dyn RelayListener>);
    /// Publish a signed event to the topic.
    fn publish(&self, event: Event);
    /// Tear the connection down.
    fn shutdown(&self);
}
