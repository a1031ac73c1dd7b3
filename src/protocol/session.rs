//! Per-peer SSU session
//!
//! A session owns the handshake and key state for one remote endpoint and
//! dispatches every authenticated datagram from it.
//!
//! ```text
//! Unknown --connect--> RequestSent --SessionCreated--> RequestSent (confirmed sent)
//!                                  --first datagram under session key--> Established
//! Unknown (inbound) --SessionRequest--> Unknown --SessionConfirmed--> Established
//! Introduced --hole punch--> Unknown --connect--> ...
//! any --timeout / close / MAC failure--> Failed
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use crate::crypto::dh::{DhKeyPair, DH_KEY_LEN};
use crate::error::{ProtocolError, SsuError};
use crate::protocol::codec::{self, PacketKeys};
use crate::protocol::context::{Followup, SessionContext, SessionEvent, TerminationReason};
use crate::protocol::handshake::{self, SessionKeys};
use crate::protocol::messages::{
    mtu_for, Header, Message, PayloadType, PeerTest, RelayIntro, RelayResponse, SessionConfirmed,
    SessionCreated, SessionRequest, HEADER_SIZE, IV_SIZE, KEY_SIZE,
};
use crate::protocol::relay::{self, PeerTestRole};
use crate::router::RouterInfo;

/// Data payload with no flags and no fragments
const KEEP_ALIVE: [u8; 2] = [0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unknown,
    RequestSent,
    Introduced,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Handshake must complete before the deadline
    Connect,
    /// Established session must see traffic before the deadline
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
}

/// Handshake material, dropped once the session is established
#[derive(Debug)]
struct PendingHandshake {
    dh: DhKeyPair,
    /// Peer's DH public value once received
    peer_public: Option<Box<[u8; DH_KEY_LEN]>>,
    /// Responder: our address as the initiator dialled it
    claimed_ip: Option<IpAddr>,
    /// Responder: relay tag we handed out in SessionCreated
    relay_tag: u32,
    /// Initiator: SessionConfirmed has gone out
    confirmed: bool,
}

impl PendingHandshake {
    fn new(dh: DhKeyPair) -> Self {
        Self {
            dh,
            peer_public: None,
            claimed_ip: None,
            relay_tag: 0,
            confirmed: false,
        }
    }
}

/// Which key authenticated a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyUsed {
    Session,
    Intro,
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub endpoint: SocketAddr,
    pub state: SessionState,
    pub relay_tag: u32,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub age_secs: u64,
}

#[derive(Debug)]
pub struct Session {
    endpoint: SocketAddr,
    remote_router: Option<RouterInfo>,
    /// Key the peer reads handshake-phase datagrams with
    intro_key: Option<[u8; KEY_SIZE]>,
    state: SessionState,
    initiator: bool,
    keys: Option<SessionKeys>,
    handshake: Option<PendingHandshake>,
    /// Non-zero if the peer agreed to act as our introducer
    relay_tag: u32,
    /// Run a peer test once established
    peer_test: bool,
    peer_test_nonces: HashSet<u32>,
    /// Nonce of our outstanding RelayRequest
    relay_nonce: Option<u32>,
    delayed: Vec<Bytes>,
    /// Our endpoint as the peer reported it in SessionCreated
    external: Option<SocketAddr>,
    sent_bytes: u64,
    received_bytes: u64,
    created_at: Instant,
    timer: Option<Timer>,
}

impl Session {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            remote_router: None,
            intro_key: None,
            state: SessionState::Unknown,
            initiator: false,
            keys: None,
            handshake: None,
            relay_tag: 0,
            peer_test: false,
            peer_test_nonces: HashSet::new(),
            relay_nonce: None,
            delayed: Vec::new(),
            external: None,
            sent_bytes: 0,
            received_bytes: 0,
            created_at: Instant::now(),
            timer: None,
        }
    }

    /// Session created by a datagram from an unknown endpoint
    pub fn inbound(endpoint: SocketAddr, connect_timeout: Duration) -> Self {
        let mut session = Self::new(endpoint);
        session.arm(TimerKind::Connect, connect_timeout);
        session
    }

    /// Session to a router we want to reach
    pub fn outbound(endpoint: SocketAddr, router: RouterInfo, peer_test: bool) -> Self {
        let mut session = Self::new(endpoint);
        session.intro_key = router.address.as_ref().map(|a| a.intro_key);
        session.remote_router = Some(router);
        session.peer_test = peer_test;
        session
    }

    /// Session to an introducer known only by its endpoint and key
    pub fn to_introducer(endpoint: SocketAddr, intro_key: [u8; KEY_SIZE]) -> Self {
        let mut session = Self::new(endpoint);
        session.intro_key = Some(intro_key);
        session
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    /// Key the peer reads handshake-phase datagrams with
    pub fn intro_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.intro_key
    }

    pub fn relay_tag(&self) -> u32 {
        self.relay_tag
    }

    pub fn remote_router(&self) -> Option<&RouterInfo> {
        self.remote_router.as_ref()
    }

    pub fn external_address(&self) -> Option<SocketAddr> {
        self.external
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn peer_test_nonces(&self) -> &HashSet<u32> {
        &self.peer_test_nonces
    }

    pub fn relay_nonce(&self) -> Option<u32> {
        self.relay_nonce
    }

    pub fn has_dh_keys(&self) -> bool {
        self.handshake.is_some()
    }

    pub fn queued_messages(&self) -> usize {
        self.delayed.len()
    }

    pub fn timer(&self) -> Option<(TimerKind, Instant)> {
        self.timer.map(|t| (t.kind, t.deadline))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            endpoint: self.endpoint,
            state: self.state,
            relay_tag: self.relay_tag,
            sent_bytes: self.sent_bytes,
            received_bytes: self.received_bytes,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    pub(crate) fn add_peer_test_nonce(&mut self, nonce: u32) {
        self.peer_test_nonces.insert(nonce);
    }

    pub(crate) fn remove_peer_test_nonce(&mut self, nonce: u32) {
        self.peer_test_nonces.remove(&nonce);
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some(Timer {
            kind,
            deadline: Instant::now() + after,
        });
    }

    /// Fire the timer if its deadline has passed.
    ///
    /// Returns the reason the session must be terminated, if any.
    pub fn poll_timer(&mut self, now: Instant) -> Option<TerminationReason> {
        let timer = self.timer?;
        if timer.deadline > now {
            return None;
        }
        self.timer = None;

        match timer.kind {
            TimerKind::Connect if self.state != SessionState::Established => {
                tracing::warn!("SSU session to {} was not established", self.endpoint);
                Some(TerminationReason::HandshakeTimeout)
            }
            TimerKind::Connect => None,
            TimerKind::Idle => {
                tracing::info!("SSU no activity from {}", self.endpoint);
                Some(TerminationReason::IdleTimeout)
            }
        }
    }

    /// Send a datagram to the peer, counting it against this session
    fn transmit(&mut self, datagram: Vec<u8>, ctx: &mut SessionContext) -> Result<(), SsuError> {
        let mtu = mtu_for(&self.endpoint);
        if datagram.len() > mtu {
            return Err(ProtocolError::PayloadTooLarge {
                size: datagram.len(),
                mtu,
            }
            .into());
        }
        self.sent_bytes += datagram.len() as u64;
        ctx.transmit(self.endpoint, datagram);
        Ok(())
    }

    /// Seal under the session keys and send
    fn send_sealed(
        &mut self,
        payload_type: PayloadType,
        body: &[u8],
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        let keys = self.keys.as_ref().ok_or(ProtocolError::NoSession)?;
        let datagram = codec::seal_random(payload_type, body, keys.packet_keys())?;
        self.transmit(datagram, ctx)
    }

    /// Start the handshake. No-op unless the session is `Unknown`.
    pub fn connect(&mut self, ctx: &mut SessionContext) -> Result<(), SsuError> {
        if self.state != SessionState::Unknown {
            tracing::debug!("Connect to {} ignored in state {:?}", self.endpoint, self.state);
            return Ok(());
        }
        let intro_key = self.intro_key.ok_or(ProtocolError::NoAddress)?;

        let dh = ctx.dh.next_key_pair();
        let datagram = handshake::create_session_request(&dh, self.endpoint, &intro_key)?;
        self.handshake = Some(PendingHandshake::new(dh));
        self.state = SessionState::RequestSent;
        self.initiator = true;
        self.arm(TimerKind::Connect, ctx.settings.connect_timeout);

        tracing::info!("Connecting to {}", self.endpoint);
        self.transmit(datagram, ctx)
    }

    /// Wait for the peer to punch a hole towards us after an introduction
    pub fn wait_for_introduction(&mut self, ctx: &SessionContext) {
        self.state = SessionState::Introduced;
        self.arm(TimerKind::Connect, ctx.settings.connect_timeout);
    }

    /// Ask this session's peer (an introducer) to introduce us to `relay_tag`.
    ///
    /// `introducer_key` seals the request while no session key exists.
    pub fn introduce(
        &mut self,
        relay_tag: u32,
        introducer_key: &[u8; KEY_SIZE],
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        let own_key = ctx.own_intro_key().ok_or(ProtocolError::NoAddress)?;
        if self.state == SessionState::Unknown {
            self.arm(TimerKind::Connect, ctx.settings.connect_timeout);
        }

        let nonce = relay::random_nonzero();
        let keys = match (&self.keys, self.state) {
            (Some(keys), SessionState::Established) => keys.packet_keys(),
            _ => PacketKeys::intro(introducer_key),
        };
        let datagram = relay::create_relay_request(relay_tag, &own_key, nonce, keys)?;
        self.relay_nonce = Some(nonce);

        tracing::debug!(
            "RelayRequest to {} for tag {} nonce {}",
            self.endpoint,
            relay_tag,
            nonce
        );
        self.transmit(datagram, ctx)
    }

    /// Send an application message, or queue it until established
    pub fn send(&mut self, message: Bytes, ctx: &mut SessionContext) -> Result<(), SsuError> {
        if !self.is_established() {
            self.delayed.push(message);
            return Ok(());
        }
        self.send_message(&message, ctx)
    }

    fn send_message(&mut self, message: &Bytes, ctx: &mut SessionContext) -> Result<(), SsuError> {
        for payload in ctx.delivery.fragment(self.endpoint, message) {
            self.send_sealed(PayloadType::Data, &payload, ctx)?;
        }
        Ok(())
    }

    /// Empty Data datagram that keeps the NAT mapping and the peer's idle timer alive
    pub fn send_keep_alive(&mut self, ctx: &mut SessionContext) -> Result<(), SsuError> {
        self.send_sealed(PayloadType::Data, &KEEP_ALIVE, ctx)?;
        if self.is_established() {
            self.arm(TimerKind::Idle, ctx.settings.termination_timeout);
        }
        Ok(())
    }

    /// Start a peer test as Alice
    pub fn send_peer_test(&mut self, ctx: &mut SessionContext) -> Result<(), SsuError> {
        let intro_key = ctx.own_intro_key().ok_or(ProtocolError::NoAddress)?;
        let nonce = relay::random_nonzero();
        self.peer_test_nonces.insert(nonce);
        self.peer_test = true;

        let test = PeerTest {
            nonce,
            address: None,
            port: 0,
            intro_key,
        };
        tracing::debug!("PeerTest {} to {}", nonce, self.endpoint);
        self.send_sealed(PayloadType::PeerTest, &test.encode(), ctx)
    }

    /// Send a PeerTest over this session
    pub(crate) fn relay_peer_test(
        &mut self,
        test: &PeerTest,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        self.send_sealed(PayloadType::PeerTest, &test.encode(), ctx)
    }

    /// Introducer side: tell `target` where the tagged initiator is.
    ///
    /// Sealed with the session keys if this session is established,
    /// otherwise with the key the target supplied.
    pub(crate) fn send_relay_response(
        &mut self,
        initiator: SocketAddr,
        target: SocketAddr,
        nonce: u32,
        target_key: &[u8; KEY_SIZE],
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        let established = self.is_established();
        let keys = match (&self.keys, established) {
            (Some(keys), true) => keys.packet_keys(),
            _ => PacketKeys::intro(target_key),
        };
        let datagram = relay::create_relay_response(initiator, target, nonce, keys)?;
        if established {
            self.transmit(datagram, ctx)
        } else {
            ctx.transmit(target, datagram);
            Ok(())
        }
    }

    /// Introducer side: ask our peer to punch a hole towards `target`
    pub(crate) fn send_relay_intro(
        &mut self,
        target: SocketAddr,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        let keys = self.keys.as_ref().ok_or(ProtocolError::NoSession)?;
        let datagram = relay::create_relay_intro(target, keys.packet_keys())?;
        self.transmit(datagram, ctx)
    }

    /// Tear down: best-effort SessionDestroyed, hand queued messages back
    pub fn close(&mut self, ctx: &mut SessionContext) {
        if self.state == SessionState::Failed {
            return;
        }
        self.timer = None;
        self.handshake = None;

        if let Some(keys) = self.keys.as_ref() {
            match handshake::create_session_destroyed(keys) {
                Ok(datagram) => ctx.transmit(self.endpoint, datagram),
                Err(e) => tracing::debug!("SessionDestroyed to {} failed: {}", self.endpoint, e),
            }
        }

        let delayed = std::mem::take(&mut self.delayed);
        if !delayed.is_empty() {
            ctx.undelivered(self.endpoint, delayed);
        }
        self.state = SessionState::Failed;
    }

    /// Handle one datagram from the peer.
    ///
    /// The buffer is decrypted in place. An error that
    /// [`SsuError::is_fatal`] reports as fatal means the session must be
    /// torn down.
    pub fn process_datagram(
        &mut self,
        datagram: &mut [u8],
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        self.received_bytes += datagram.len() as u64;

        if self.state == SessionState::Introduced {
            tracing::debug!("Hole punch from {}", self.endpoint);
            self.state = SessionState::Unknown;
            return self.connect(ctx);
        }

        if datagram.is_empty() {
            return Ok(());
        }

        // Too short to carry a MAC; dropped before any crypto
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: HEADER_SIZE,
                got: datagram.len(),
            }
            .into());
        }

        if self.is_established() {
            self.arm(TimerKind::Idle, ctx.settings.termination_timeout);
        }

        let key_used = self.authenticate(datagram, ctx)?;
        let header = Header::from_bytes(datagram)?;
        let payload_type = match header.payload_type() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("{} from {}", e, self.endpoint);
                return Ok(());
            }
        };
        let message = Message::decode(payload_type, &datagram[HEADER_SIZE..])?;

        // The first datagram under the session key after SessionConfirmed
        // completes the initiator's handshake.
        if key_used == KeyUsed::Session
            && self.state == SessionState::RequestSent
            && self.handshake.as_ref().map(|h| h.confirmed).unwrap_or(false)
        {
            self.established(ctx)?;
        }

        // Anyone can seal under a published intro key
        if key_used == KeyUsed::Intro
            && matches!(message, Message::Data(_) | Message::SessionDestroyed)
        {
            tracing::warn!(
                "{:?} from {} not under the session key, dropped",
                payload_type,
                self.endpoint
            );
            return Ok(());
        }

        match message {
            Message::Data(payload) => self.process_data(&payload, ctx),
            Message::SessionRequest(request) => self.process_session_request(request, ctx),
            Message::SessionCreated(created) => {
                self.process_session_created(&created, &header.iv, ctx)
            }
            Message::SessionConfirmed(confirmed) => self.process_session_confirmed(confirmed, ctx),
            Message::SessionDestroyed => {
                tracing::debug!("SSU session destroyed by {}", self.endpoint);
                // Nothing to notify on teardown
                self.keys = None;
                ctx.follow_up(Followup::Terminate {
                    endpoint: self.endpoint,
                    reason: TerminationReason::PeerDestroyed,
                });
                Ok(())
            }
            Message::RelayRequest(request) => {
                ctx.follow_up(Followup::Relay {
                    from: self.endpoint,
                    request,
                });
                Ok(())
            }
            Message::RelayResponse(response) => self.process_relay_response(&response, ctx),
            Message::RelayIntro(intro) => self.process_relay_intro(&intro, ctx),
            Message::PeerTest(test) => self.process_peer_test(test, ctx),
        }
    }

    /// Try the session key, then the peer's intro key, then our own.
    /// Decrypts in place with whichever key matched.
    fn authenticate(
        &self,
        datagram: &mut [u8],
        ctx: &SessionContext,
    ) -> Result<KeyUsed, SsuError> {
        if let Some(keys) = self.keys.as_ref() {
            if codec::validate(datagram, &keys.mac_key) {
                codec::decrypt(datagram, &keys.session_key)?;
                return Ok(KeyUsed::Session);
            }
        }

        let own_key = ctx.own_intro_key();
        let peer_key = self.intro_key.or(own_key);
        for key in [peer_key, own_key].into_iter().flatten() {
            if codec::validate(datagram, &key) {
                codec::decrypt(datagram, &key)?;
                return Ok(KeyUsed::Intro);
            }
        }

        tracing::error!("MAC verification failed for datagram from {}", self.endpoint);
        Err(ProtocolError::MacVerificationFailed.into())
    }

    fn established(&mut self, ctx: &mut SessionContext) -> Result<(), SsuError> {
        self.state = SessionState::Established;
        self.handshake = None;
        self.arm(TimerKind::Idle, ctx.settings.termination_timeout);

        tracing::info!("SSU session established with {}", self.endpoint);
        ctx.emit(SessionEvent::Established {
            peer: self.endpoint,
            initiator: self.initiator,
        });

        for message in std::mem::take(&mut self.delayed) {
            self.send_message(&message, ctx)?;
        }

        let peer_tests = self
            .remote_router
            .as_ref()
            .map(|r| r.peer_testing)
            .unwrap_or(false);
        if self.peer_test && peer_tests {
            self.send_peer_test(ctx)?;
        }
        Ok(())
    }

    fn process_data(&mut self, payload: &[u8], ctx: &mut SessionContext) -> Result<(), SsuError> {
        if !self.is_established() {
            tracing::debug!("Data from {} before session established", self.endpoint);
            return Ok(());
        }
        ctx.delivery.process_message(self.endpoint, payload);
        Ok(())
    }

    fn process_session_request(
        &mut self,
        request: SessionRequest,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        if self.initiator {
            tracing::debug!("Unexpected SessionRequest from {}", self.endpoint);
            return Ok(());
        }
        if self.is_established() {
            tracing::info!("{} restarted its handshake", self.endpoint);
            self.state = SessionState::Unknown;
            self.arm(TimerKind::Connect, ctx.settings.connect_timeout);
        }

        let mut pending = match self.handshake.take() {
            Some(pending) => pending,
            None => PendingHandshake::new(ctx.dh.next_key_pair()),
        };
        let shared = pending.dh.agree(&request.x)?;
        let keys = handshake::derive_session_keys(&shared)?;

        if pending.relay_tag == 0 && ctx.router.is_introducer() {
            pending.relay_tag = relay::random_nonzero();
            ctx.follow_up(Followup::RegisterRelay {
                tag: pending.relay_tag,
                endpoint: self.endpoint,
            });
        }

        let datagram = handshake::create_session_created(
            ctx.router.as_ref(),
            &request.x,
            &pending.dh,
            &keys,
            self.endpoint,
            pending.relay_tag,
        )?;

        pending.peer_public = Some(Box::new(request.x));
        pending.claimed_ip = request.address;
        self.handshake = Some(pending);
        self.keys = Some(keys);
        self.transmit(datagram, ctx)
    }

    fn process_session_created(
        &mut self,
        created: &SessionCreated,
        iv: &[u8; IV_SIZE],
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        let Some(pending) = self.handshake.as_ref() else {
            tracing::debug!("Unsolicited SessionCreated from {}", self.endpoint);
            return Ok(());
        };
        if self.state != SessionState::RequestSent || pending.confirmed {
            tracing::debug!("Duplicate SessionCreated from {}", self.endpoint);
            return Ok(());
        }

        let identity = self.remote_router.as_ref().map(|r| r.identity.as_slice());
        let outcome = handshake::process_session_created(
            ctx.router.as_ref(),
            &pending.dh,
            self.endpoint,
            identity,
            iv,
            created,
        )?;

        if !outcome.signature_valid {
            tracing::error!("SessionCreated signature verification failed for {}", self.endpoint);
            if ctx.settings.strict_signatures {
                return Err(ProtocolError::SignatureVerificationFailed.into());
            }
        }

        let datagram = handshake::create_session_confirmed(
            ctx.router.as_ref(),
            pending.dh.public_key(),
            &created.y,
            outcome.observed,
            self.endpoint,
            outcome.relay_tag,
            &outcome.keys,
        )?;

        ctx.router.update_address(outcome.observed.ip());
        ctx.emit(SessionEvent::ExternalAddress {
            peer: self.endpoint,
            address: outcome.observed,
        });

        if let Some(pending) = self.handshake.as_mut() {
            pending.peer_public = Some(Box::new(created.y));
            pending.confirmed = true;
        }
        self.relay_tag = outcome.relay_tag;
        self.external = Some(outcome.observed);
        self.keys = Some(outcome.keys);
        self.arm(TimerKind::Connect, ctx.settings.connect_timeout);
        self.transmit(datagram, ctx)
    }

    fn process_session_confirmed(
        &mut self,
        confirmed: SessionConfirmed,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        if self.is_established() || self.initiator {
            tracing::debug!("Unexpected SessionConfirmed from {}", self.endpoint);
            return Ok(());
        }
        let Some(pending) = self.handshake.as_ref() else {
            tracing::debug!("Unsolicited SessionConfirmed from {}", self.endpoint);
            return Ok(());
        };
        let Some(x) = pending.peer_public.as_deref() else {
            tracing::debug!("SessionConfirmed from {} before SessionRequest", self.endpoint);
            return Ok(());
        };

        let address = ctx.router.address().ok_or(ProtocolError::NoAddress)?;
        let local = SocketAddr::new(pending.claimed_ip.unwrap_or(address.host), address.port);

        handshake::verify_session_confirmed(
            ctx.router.as_ref(),
            x,
            pending.dh.public_key(),
            self.endpoint,
            local,
            pending.relay_tag,
            &confirmed,
        )
        .map_err(|e| {
            tracing::error!("SessionConfirmed from {} rejected: {}", self.endpoint, e);
            e
        })?;

        if self.remote_router.is_none() {
            self.remote_router = Some(RouterInfo::new(confirmed.identity, None));
        }

        self.established(ctx)?;
        // Lets the initiator finish its side of the handshake
        self.send_keep_alive(ctx)
    }

    fn process_relay_response(
        &mut self,
        response: &RelayResponse,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        tracing::debug!(
            "RelayResponse from {}: initiator {} us {} nonce {}",
            self.endpoint,
            response.initiator,
            response.target,
            response.nonce
        );

        if let Some(expected) = self.relay_nonce {
            if expected != response.nonce {
                tracing::warn!(
                    "RelayResponse nonce {} from {} does not match {}",
                    response.nonce,
                    self.endpoint,
                    expected
                );
                return Ok(());
            }
        }
        self.relay_nonce = None;

        ctx.router.update_address(response.target.ip());
        ctx.emit(SessionEvent::ExternalAddress {
            peer: self.endpoint,
            address: response.target,
        });

        if !self.is_established() {
            ctx.follow_up(Followup::Terminate {
                endpoint: self.endpoint,
                reason: TerminationReason::IntroductionComplete,
            });
        }
        Ok(())
    }

    fn process_relay_intro(
        &mut self,
        intro: &RelayIntro,
        ctx: &mut SessionContext,
    ) -> Result<(), SsuError> {
        if !intro.target.is_ipv4() {
            tracing::warn!("RelayIntro from {} with unsupported address", self.endpoint);
            return Ok(());
        }
        tracing::debug!("RelayIntro from {}: punching {}", self.endpoint, intro.target);
        ctx.transmit(intro.target, Vec::new());
        Ok(())
    }

    fn process_peer_test(&mut self, test: PeerTest, ctx: &mut SessionContext) -> Result<(), SsuError> {
        let port_set = test.port != 0;
        let alice = match test.address {
            Some(ip @ IpAddr::V4(_)) => Some(SocketAddr::new(ip, test.port)),
            Some(IpAddr::V6(_)) if port_set => {
                return Err(ProtocolError::UnsupportedAddressFamily { size: 16 }.into());
            }
            None if port_set => {
                return Err(ProtocolError::UnsupportedAddressFamily { size: 0 }.into());
            }
            _ => None,
        };

        let role = PeerTestRole::classify(
            self.peer_test_nonces.contains(&test.nonce),
            self.peer_test,
            port_set,
            self.is_established(),
        );
        tracing::debug!("PeerTest {} from {} as {:?}", test.nonce, self.endpoint, role);

        match role {
            PeerTestRole::AliceFromBob => {
                self.peer_test_nonces.remove(&test.nonce);
                self.peer_test = false;
                ctx.emit(SessionEvent::PeerTestCompleted {
                    peer: self.endpoint,
                    nonce: test.nonce,
                    external: alice,
                    direct: false,
                });
                Ok(())
            }
            PeerTestRole::AliceFromCharlie => {
                ctx.emit(SessionEvent::PeerTestCompleted {
                    peer: self.endpoint,
                    nonce: test.nonce,
                    external: alice,
                    direct: true,
                });
                Ok(())
            }
            PeerTestRole::BobFromCharlie => {
                self.peer_test_nonces.remove(&test.nonce);
                ctx.follow_up(Followup::PeerTestToAlice { test });
                Ok(())
            }
            PeerTestRole::CharlieFromAlice => {
                let reply = PeerTest {
                    address: Some(self.endpoint.ip()),
                    port: self.endpoint.port(),
                    ..test
                };
                let datagram =
                    relay::create_peer_test(&reply, PacketKeys::intro(&reply.intro_key))?;
                self.transmit(datagram, ctx)
            }
            PeerTestRole::CharlieFromBob => {
                // Both answers go out now; the nonce is not kept
                self.relay_peer_test(&test, ctx)?;
                if let Some(alice) = alice {
                    let datagram =
                        relay::create_peer_test(&test, PacketKeys::intro(&test.intro_key))?;
                    ctx.transmit(alice, datagram);
                }
                Ok(())
            }
            PeerTestRole::BobFromAlice => {
                self.peer_test_nonces.insert(test.nonce);
                let forwarded = PeerTest {
                    address: Some(self.endpoint.ip()),
                    port: self.endpoint.port(),
                    ..test
                };
                ctx.follow_up(Followup::PeerTestToCharlie {
                    from: self.endpoint,
                    test: forwarded,
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsDhKeySource;
    use crate::delivery::ChannelDelivery;
    use crate::protocol::context::SessionSettings;
    use crate::router::{LocalRouter, RouterAddress, RouterContext};

    fn context(port: u16) -> SessionContext {
        let address = RouterAddress::new(
            SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            [port as u8; KEY_SIZE],
        );
        let (delivery, _rx) = ChannelDelivery::new();
        SessionContext::new(
            Box::new(LocalRouter::generate(Some(address))),
            Box::new(OsDhKeySource),
            Box::new(delivery),
            SessionSettings::default(),
        )
    }

    fn peer_info(port: u16) -> RouterInfo {
        let address = RouterAddress::new(
            SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            [port as u8; KEY_SIZE],
        );
        RouterInfo::new(LocalRouter::generate(None).identity().to_vec(), Some(address))
    }

    #[test]
    fn test_inbound_arms_connect_timer() {
        let session = Session::inbound("127.0.0.1:6000".parse().unwrap(), Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Unknown);
        assert_eq!(session.timer().unwrap().0, TimerKind::Connect);
        assert!(session.keys().is_none());
    }

    #[test]
    fn test_connect_sends_request_once() {
        let mut ctx = context(6100);
        let endpoint: SocketAddr = "127.0.0.1:6101".parse().unwrap();
        let mut session = Session::outbound(endpoint, peer_info(6101), false);

        session.connect(&mut ctx).unwrap();
        assert_eq!(session.state(), SessionState::RequestSent);
        assert!(session.has_dh_keys());

        // Already in flight
        session.connect(&mut ctx).unwrap();

        let outbox = ctx.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, endpoint);
        assert_eq!(outbox[0].payload.len(), 304);
        assert!(codec::validate(&outbox[0].payload, &[6101u16 as u8; KEY_SIZE]));
    }

    #[test]
    fn test_connect_timeout() {
        let mut ctx = context(6200);
        let mut session = Session::outbound(
            "127.0.0.1:6201".parse().unwrap(),
            peer_info(6201),
            false,
        );
        session.connect(&mut ctx).unwrap();

        assert_eq!(session.poll_timer(Instant::now()), None);
        assert_eq!(
            session.poll_timer(Instant::now() + Duration::from_secs(6)),
            Some(TerminationReason::HandshakeTimeout)
        );
        // Timer is consumed
        assert_eq!(session.poll_timer(Instant::now() + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_garbage_fails_authentication() {
        let mut ctx = context(6300);
        let mut session = Session::inbound("127.0.0.1:6301".parse().unwrap(), Duration::from_secs(5));
        let mut datagram = vec![0x5a; 64];

        let err = session.process_datagram(&mut datagram, &mut ctx).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.info().received_bytes, 64);
    }

    #[test]
    fn test_messages_queued_until_established() {
        let mut ctx = context(6400);
        let endpoint: SocketAddr = "127.0.0.1:6401".parse().unwrap();
        let mut session = Session::outbound(endpoint, peer_info(6401), false);

        session.send(Bytes::from_static(b"hello"), &mut ctx).unwrap();
        session.send(Bytes::from_static(b"world"), &mut ctx).unwrap();
        assert_eq!(session.queued_messages(), 2);
        assert!(ctx.drain_outbox().is_empty());

        session.close(&mut ctx);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.queued_messages(), 0);
        // No session key, so no SessionDestroyed
        assert!(ctx.drain_outbox().is_empty());

        // Idempotent
        session.close(&mut ctx);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_introduced_session_connects_on_hole_punch() {
        let mut ctx = context(6500);
        let endpoint: SocketAddr = "127.0.0.1:6501".parse().unwrap();
        let mut session = Session::outbound(endpoint, peer_info(6501), false);

        session.wait_for_introduction(&ctx);
        assert_eq!(session.state(), SessionState::Introduced);
        assert_eq!(session.timer().unwrap().0, TimerKind::Connect);

        session.process_datagram(&mut [], &mut ctx).unwrap();
        assert_eq!(session.state(), SessionState::RequestSent);
        let outbox = ctx.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, endpoint);
    }

    #[test]
    fn test_short_datagram_is_format_error() {
        let mut ctx = context(6800);
        let mut session = Session::inbound("127.0.0.1:6801".parse().unwrap(), Duration::from_secs(5));

        let err = session
            .process_datagram(&mut [0u8; HEADER_SIZE - 1], &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            SsuError::Protocol(ProtocolError::InvalidMessageLength { got: 36, .. })
        ));
        assert!(!err.is_fatal());
        assert_eq!(session.state(), SessionState::Unknown);
        assert!(ctx.drain_outbox().is_empty());
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut ctx = context(6900);
        let mut session = Session::inbound("127.0.0.1:6901".parse().unwrap(), Duration::from_secs(5));

        let err = session.transmit(vec![0u8; 1485], &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            SsuError::Protocol(ProtocolError::PayloadTooLarge { size: 1485, mtu: 1484 })
        ));
        assert!(!err.is_fatal());
        assert!(ctx.drain_outbox().is_empty());
        assert_eq!(session.info().sent_bytes, 0);

        session.transmit(vec![0u8; 1484], &mut ctx).unwrap();
        assert_eq!(ctx.drain_outbox().len(), 1);

        // Smaller limit for IPv6 peers
        let mut session = Session::inbound("[::1]:6902".parse().unwrap(), Duration::from_secs(5));
        assert!(session.transmit(vec![0u8; 1473], &mut ctx).is_err());
        session.transmit(vec![0u8; 1472], &mut ctx).unwrap();
    }

    #[test]
    fn test_empty_datagram_ignored() {
        let mut ctx = context(6600);
        let mut session = Session::inbound("127.0.0.1:6601".parse().unwrap(), Duration::from_secs(5));
        session.process_datagram(&mut [], &mut ctx).unwrap();
        assert_eq!(session.state(), SessionState::Unknown);
        assert!(ctx.drain_outbox().is_empty());
    }

    #[test]
    fn test_peer_test_rejects_ipv6_with_port() {
        let mut ctx = context(6700);
        let mut session = Session::inbound("127.0.0.1:6701".parse().unwrap(), Duration::from_secs(5));
        let test = PeerTest {
            nonce: 1,
            address: Some("::1".parse().unwrap()),
            port: 80,
            intro_key: [0; KEY_SIZE],
        };
        let err = session.process_peer_test(test, &mut ctx).unwrap_err();
        assert!(!err.is_fatal());
        assert!(ctx.drain_outbox().is_empty());
    }
}
