//! Deterministic simulation harness for the Marmot engine.
//!
//! The engine is sans-IO: it reads time and randomness from an
//! `Environment` and moves bytes through the relay/MoQ service traits.
//! This crate provides the simulated side of each seam:
//!
//! - [`sim_env`]: virtual clock + seeded RNG, for replayable runs
//! - [`sim_relay`]: in-memory signalling relay with backlog replay,
//!   signature verification, and deterministic drop injection
//! - [`sim_moq`]: in-memory MoQ relay with named single-writer tracks,
//!   backlog replay on late subscribe, and delivery pause/reorder hooks
//! - [`scenario`]: builds whole multi-party worlds wired to shared
//!   networks and records every emitted event
//!
//! Integration tests for the end-to-end scenarios live in `tests/`.

#![warn(missing_docs)]

pub mod scenario;
pub mod sim_env;
pub mod sim_moq;
pub mod sim_relay;

pub use scenario::{Participant, Scenario};
pub use sim_env::SimEnv;
pub use sim_moq::SimMoqNetwork;
pub use sim_relay::SimRelayNetwork;
