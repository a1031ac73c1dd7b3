//! Shared state a session needs while it processes a datagram or timer
//!
//! Sessions never perform I/O. They push datagrams onto the outbox, emit
//! events, and leave follow-ups that need other sessions (relay lookups,
//! peer test forwarding, teardown) for the registry to run.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::crypto::DhKeySource;
use crate::delivery::DeliveryLayer;
use crate::protocol::messages::{PeerTest, RelayRequest, KEY_SIZE};
use crate::router::RouterContext;

/// Abandon a handshake after this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drop an established session after this long without traffic
pub const TERMINATION_TIMEOUT: Duration = Duration::from_secs(330);

/// An outbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Closed locally
    Closed,
    /// Peer sent SessionDestroyed
    PeerDestroyed,
    HandshakeTimeout,
    IdleTimeout,
    /// No key authenticated a datagram
    AuthenticationFailed,
    /// Key derivation or signature check failed
    HandshakeFailed,
    /// Session only existed to carry an introduction
    IntroductionComplete,
    Shutdown,
}

/// Notifications for the owner of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Established {
        peer: SocketAddr,
        initiator: bool,
    },
    Terminated {
        peer: SocketAddr,
        reason: TerminationReason,
    },
    /// A peer told us how it sees us
    ExternalAddress {
        peer: SocketAddr,
        address: SocketAddr,
    },
    PeerTestCompleted {
        peer: SocketAddr,
        nonce: u32,
        external: Option<SocketAddr>,
        direct: bool,
    },
    IntroducersUpdated {
        introducers: Vec<SocketAddr>,
    },
}

/// Work a session hands back to the registry
#[derive(Debug, Clone)]
pub(crate) enum Followup {
    /// Remember that `tag` belongs to the session at `endpoint`
    RegisterRelay { tag: u32, endpoint: SocketAddr },
    /// RelayRequest received on the session at `from`
    Relay { from: SocketAddr, request: RelayRequest },
    /// Alice's test arrived at Bob; pick a Charlie
    PeerTestToCharlie { from: SocketAddr, test: PeerTest },
    /// Charlie reported back to Bob; pass it on to Alice
    PeerTestToAlice { test: PeerTest },
    Terminate {
        endpoint: SocketAddr,
        reason: TerminationReason,
    },
}

/// Per-session tunables
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub termination_timeout: Duration,
    /// Treat a bad SessionCreated signature as fatal instead of logging it
    pub strict_signatures: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            termination_timeout: TERMINATION_TIMEOUT,
            strict_signatures: false,
        }
    }
}

/// Collaborators and output queues shared by every session of a registry
pub struct SessionContext {
    pub(crate) router: Box<dyn RouterContext>,
    pub(crate) dh: Box<dyn DhKeySource>,
    pub(crate) delivery: Box<dyn DeliveryLayer>,
    pub(crate) settings: SessionSettings,
    outbox: Vec<Transmit>,
    followups: Vec<Followup>,
    events: Vec<SessionEvent>,
}

impl SessionContext {
    pub fn new(
        router: Box<dyn RouterContext>,
        dh: Box<dyn DhKeySource>,
        delivery: Box<dyn DeliveryLayer>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            router,
            dh,
            delivery,
            settings,
            outbox: Vec::new(),
            followups: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn transmit(&mut self, to: SocketAddr, payload: Vec<u8>) {
        self.outbox.push(Transmit { to, payload });
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub(crate) fn follow_up(&mut self, followup: Followup) {
        self.followups.push(followup);
    }

    pub(crate) fn take_followups(&mut self) -> Vec<Followup> {
        std::mem::take(&mut self.followups)
    }

    pub fn drain_outbox(&mut self) -> Vec<Transmit> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Our published intro key
    pub fn own_intro_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.router.address().map(|a| a.intro_key)
    }

    pub fn router(&self) -> &dyn RouterContext {
        self.router.as_ref()
    }

    /// Hand a queue of undelivered messages back to the delivery layer
    pub(crate) fn undelivered(&mut self, peer: SocketAddr, messages: Vec<Bytes>) {
        self.delivery.undelivered(peer, messages);
    }
}
