//! Marmot protocol engine
//!
//! This crate is the client-side engine of an end-to-end encrypted group
//! chat and audio conferencing system: an MLS group mapped onto a
//! publish/subscribe media transport (MoQ), bootstrapped out-of-band over
//! a signed-event relay.
//!
//! # Architecture
//!
//! Protocol logic is strictly separated from I/O:
//!
//! ```text
//!      ┌─────────────────────────────┐
//!      │ marmot-core                 │
//!      │ - MLS handle (identity)     │
//!      │ - Handshake state machine   │
//!      │ - Transport bridge state    │
//!      │ - Controller / event loop   │
//!      │ - Media key schedule        │
//!      └─────────────────────────────┘
//!         ↓                       ↓
//! ┌────────────────┐   ┌─────────────────────┐
//! │ marmot-harness │   │ host drivers        │
//! │ - Virtual time │   │ - WebTransport MoQ  │
//! │ - Seeded RNG   │   │ - Relay websocket   │
//! │ - Sim networks │   │ - Real clock        │
//! └────────────────┘   └─────────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - Single-threaded: all engine state is mutated from one operation
//!   queue; service callbacks only enqueue.
//! - No I/O in core: time and randomness go through [`env::Environment`];
//!   sockets live behind the [`controller::services`] traits.
//! - No plaintext on transport surfaces: text rides MLS application
//!   messages, audio rides the exporter-derived AEAD schedule.
//!
//! # Modules
//!
//! - [`env`]: environment abstraction (time, RNG)
//! - [`error`]: engine error taxonomy
//! - [`mls`]: identity and MLS group state (C1)
//! - [`handshake`]: bootstrap handshake state machine (C2)
//! - [`bridge`]: MoQ transport bridge state (C3)
//! - [`controller`]: operation queue and host-facing events (C4)
//! - [`media`]: media key schedule and AEAD framing (C5)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bridge;
pub mod controller;
pub mod env;
pub mod error;
pub mod handshake;
pub mod media;
pub mod mls;

pub use controller::{ChatController, ChatEvent, SessionParams};
pub use env::Environment;
pub use error::{EngineError, ErrorKind};
