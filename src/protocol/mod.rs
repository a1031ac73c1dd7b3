//! SSU protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Datagram sealing and authentication
//! - Handshake logic (2048-bit DH, signed transcripts)
//! - Introduction and peer test messages
//! - Per-peer session state machine

pub mod codec;
pub mod context;
pub mod handshake;
pub mod messages;
pub mod relay;
pub mod session;
pub mod signed_data;

pub use codec::PacketKeys;
pub use context::{SessionContext, SessionEvent, SessionSettings, TerminationReason, Transmit};
pub use handshake::SessionKeys;
pub use messages::{Header, Message, PayloadType};
pub use relay::PeerTestRole;
pub use session::{Session, SessionInfo, SessionState, TimerKind};
