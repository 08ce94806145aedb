//! Host-facing session types and the engine event stream.
//!
//! Events are serde-serializable (internally tagged, snake_case) so hosts
//! can ship them across FFI or JSON boundaries unchanged. Every event
//! carries copies, never borrows into engine state.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub use marmot_proto::envelope::BootstrapRole;

pub use crate::error::RecoveryAction;
pub use crate::mls::MemberInfo;

/// Session bootstrap input (§6.3 of the host contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    /// Which bootstrap side this process plays
    pub role: BootstrapRole,
    /// Signalling relay URL
    pub signalling_url: String,
    /// MoQ relay URL
    pub moq_url: String,
    /// Bootstrap channel identifier (random 128-bit token, hex)
    pub session_id: String,
    /// Identity secret (32 bytes, hex)
    pub secret_hex: String,
    /// Known group id, when resuming
    #[serde(default)]
    pub group_id_hex: Option<String>,
    /// Admin pubkeys known out-of-band
    #[serde(default)]
    pub admin_pubkeys: Vec<String>,
    /// Peer pubkeys known out-of-band
    #[serde(default)]
    pub peer_pubkeys: Vec<String>,
}

/// User-visible bootstrap progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    /// Engine starting up
    Initializing,
    /// Creator waiting for the invitee's offer
    WaitingForKeyPackage,
    /// Invitee waiting for the creator's welcome
    WaitingForWelcome,
    /// Group established, transport connecting
    Finalizing,
    /// Transport ready
    Connected,
}

/// Events emitted to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Free-form progress line
    Status {
        /// The status text
        text: String,
    },
    /// Whether the transport accepts publishes
    Ready {
        /// True once the publish track is live (or grace expired)
        ready: bool,
    },
    /// A decrypted (or locally echoed) text message
    Message {
        /// Author pubkey
        author: String,
        /// Message body
        content: String,
        /// Sender-reported unix timestamp (seconds)
        created_at: u64,
        /// True when the local member authored it
        local: bool,
    },
    /// A commit merged; epoch advanced
    Commit {
        /// Commits observed this session
        total: u32,
    },
    /// Authoritative roster snapshot
    Roster {
        /// All members with admin flags
        members: Vec<MemberInfo>,
    },
    /// A member appeared in the roster
    MemberJoined {
        /// The new member
        member: MemberInfo,
    },
    /// A member's flags changed
    MemberUpdated {
        /// The updated member
        member: MemberInfo,
    },
    /// A member left the roster
    MemberLeft {
        /// The departed member's pubkey
        pubkey: String,
    },
    /// An invite's welcome was produced and dispatched
    InviteGenerated {
        /// Invited member's pubkey
        recipient: String,
        /// Whether admin rights were granted
        is_admin: bool,
    },
    /// An error reached the host
    Error {
        /// Human-readable description
        message: String,
        /// True when the engine stopped
        fatal: bool,
        /// What the host should do about it
        recovery: RecoveryAction,
    },
    /// Bootstrap progress changed
    Handshake {
        /// The new phase
        phase: HandshakePhase,
    },
}

impl ChatEvent {
    /// Status line helper.
    pub fn status(text: impl Into<String>) -> ChatEvent {
        ChatEvent::Status { text: text.into() }
    }

    /// Non-fatal error helper.
    pub fn transient_error(message: impl Into<String>) -> ChatEvent {
        ChatEvent::Error {
            message: message.into(),
            fatal: false,
            recovery: RecoveryAction::None,
        }
    }

    /// Fatal error helper.
    pub fn fatal_error(message: impl Into<String>, recovery: RecoveryAction) -> ChatEvent {
        ChatEvent::Error { message: message.into(), fatal: true, recovery }
    }
}

/// Callback the host registers for the event stream. Invoked on the
/// engine thread; implementations should hand off quickly.
pub type EventCallback = Rc<dyn Fn(ChatEvent)>;

/// Optional sink for inbound encrypted audio frames. The engine stays
/// codec-blind; hosts decrypt via the media primitives.
pub type AudioFrameSink = Rc<dyn Fn(&str, &str, Vec<u8>)>;
