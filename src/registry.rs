//! Session registry
//!
//! Multiplexes one UDP socket across every peer session. The registry owns
//! the endpoint table, the relay tags this node handed out as an introducer
//! and the introducers it publishes for itself when unreachable.
//!
//! It performs no I/O: datagrams go in through [`SessionRegistry::process_datagram`],
//! outbound datagrams and events are drained by the caller, and timers are
//! driven through [`SessionRegistry::handle_timers`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::seq::IteratorRandom;

use crate::crypto::DhKeySource;
use crate::delivery::DeliveryLayer;
use crate::error::{ProtocolError, SsuError};
use crate::protocol::context::{
    Followup, SessionContext, SessionEvent, SessionSettings, TerminationReason, Transmit,
};
use crate::protocol::messages::{PeerTest, RelayRequest, HEADER_SIZE};
use crate::protocol::session::{Session, SessionInfo};
use crate::router::{Introducer, RouterContext, RouterInfo};

/// Introducer refresh and keep-alive period
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a session stays usable as one of our introducers
pub const INTRODUCER_LIFETIME: Duration = Duration::from_secs(3600);

/// Introducers published at once
pub const MAX_INTRODUCERS: usize = 3;

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub session: SessionSettings,
    pub keep_alive_interval: Duration,
    pub introducer_lifetime: Duration,
    pub max_introducers: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            introducer_lifetime: INTRODUCER_LIFETIME,
            max_introducers: MAX_INTRODUCERS,
        }
    }
}

pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, Session>,
    /// Relay tag -> endpoint of the session that holds it
    relays: HashMap<u32, SocketAddr>,
    /// Sessions currently published as our introducers
    introducers: Vec<SocketAddr>,
    ctx: SessionContext,
    settings: RegistrySettings,
    next_introducer_update: Instant,
}

impl SessionRegistry {
    pub fn new(
        router: Box<dyn RouterContext>,
        dh: Box<dyn DhKeySource>,
        delivery: Box<dyn DeliveryLayer>,
        settings: RegistrySettings,
    ) -> Self {
        let ctx = SessionContext::new(router, dh, delivery, settings.session.clone());
        Self {
            sessions: HashMap::new(),
            relays: HashMap::new(),
            introducers: Vec::new(),
            ctx,
            next_introducer_update: Instant::now() + settings.keep_alive_interval,
            settings,
        }
    }

    /// Handle one datagram received from `from`.
    ///
    /// The buffer is decrypted in place.
    pub fn process_datagram(&mut self, datagram: &mut [u8], from: SocketAddr) {
        let session = match self.sessions.entry(from) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if datagram.is_empty() {
                    tracing::debug!("Hole punch from {}", from);
                    return;
                }
                if datagram.len() < HEADER_SIZE {
                    tracing::debug!("Runt datagram of {} bytes from {}", datagram.len(), from);
                    return;
                }
                tracing::info!("New SSU session from {}", from);
                entry.insert(Session::inbound(from, self.settings.session.connect_timeout))
            }
        };

        let result = session.process_datagram(datagram, &mut self.ctx);
        self.handle_result(from, result);
        self.run_followups();
    }

    /// Open a session to `router`, directly or through one of its introducers.
    ///
    /// Returns the endpoint that identifies the session.
    pub fn connect(&mut self, router: RouterInfo, peer_test: bool) -> Result<SocketAddr, SsuError> {
        let Some(address) = router.address.clone() else {
            tracing::warn!("Router {} doesn't have SSU address", router.short_hash());
            return Err(ProtocolError::NoAddress.into());
        };
        let endpoint = address.endpoint();
        if self.sessions.contains_key(&endpoint) {
            return Ok(endpoint);
        }

        let hash = router.short_hash();
        let uses_introducer = router.uses_introducer;
        let mut session = Session::outbound(endpoint, router, peer_test);

        if !uses_introducer {
            tracing::info!("Creating new SSU session to [{}] {}", hash, endpoint);
            session.connect(&mut self.ctx)?;
            self.sessions.insert(endpoint, session);
            return Ok(endpoint);
        }

        let introducer = address
            .introducers
            .iter()
            .find(|i| self.sessions.contains_key(&i.endpoint()))
            .or_else(|| address.introducers.first())
            .cloned();
        let Some(introducer) = introducer else {
            tracing::warn!("Can't connect to unreachable router [{}]: no introducers", hash);
            return Err(ProtocolError::UnroutableAddress {
                peer: endpoint.to_string(),
            }
            .into());
        };

        tracing::info!(
            "Introducing new SSU session to [{}] through {}",
            hash,
            introducer.endpoint()
        );
        session.wait_for_introduction(&self.ctx);
        self.sessions.insert(endpoint, session);

        if self.ctx.router.is_unreachable() {
            self.ctx.transmit(endpoint, Vec::new());
        }

        let introducer_endpoint = introducer.endpoint();
        let introducer_session = self
            .sessions
            .entry(introducer_endpoint)
            .or_insert_with(|| Session::to_introducer(introducer_endpoint, introducer.key));
        let result = introducer_session.introduce(introducer.tag, &introducer.key, &mut self.ctx);
        self.handle_result(introducer_endpoint, result);
        Ok(endpoint)
    }

    /// Send an application message, queued until the session is established
    pub fn send(&mut self, peer: SocketAddr, message: Bytes) -> Result<(), SsuError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(ProtocolError::NoSession)?;
        session.send(message, &mut self.ctx)
    }

    /// Start a peer test over an established session
    pub fn peer_test(&mut self, peer: SocketAddr) -> Result<(), SsuError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .filter(|s| s.is_established())
            .ok_or(ProtocolError::NoSession)?;
        session.send_peer_test(&mut self.ctx)
    }

    pub fn close(&mut self, peer: SocketAddr) {
        self.terminate(peer, TerminationReason::Closed);
    }

    pub fn close_all(&mut self) {
        let endpoints: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for endpoint in endpoints {
            self.terminate(endpoint, TerminationReason::Shutdown);
        }
    }

    /// Fire every timer whose deadline has passed
    pub fn handle_timers(&mut self, now: Instant) {
        let expired: Vec<(SocketAddr, TerminationReason)> = self
            .sessions
            .iter_mut()
            .filter_map(|(endpoint, session)| session.poll_timer(now).map(|r| (*endpoint, r)))
            .collect();
        for (endpoint, reason) in expired {
            self.terminate(endpoint, reason);
        }

        if now >= self.next_introducer_update {
            if self.ctx.router.is_unreachable() {
                self.update_introducers(now);
            }
            self.next_introducer_update = now + self.settings.keep_alive_interval;
        }
    }

    /// Earliest instant [`SessionRegistry::handle_timers`] has work to do
    pub fn next_deadline(&self) -> Instant {
        self.sessions
            .values()
            .filter_map(Session::deadline)
            .fold(self.next_introducer_update, Instant::min)
    }

    /// Keep our introducers alive, drop expired ones and top the list up
    pub fn update_introducers(&mut self, now: Instant) {
        let lifetime = self.settings.introducer_lifetime;
        let previous = std::mem::take(&mut self.introducers);
        let mut retained = Vec::with_capacity(self.settings.max_introducers);

        for endpoint in &previous {
            match self.sessions.get_mut(endpoint) {
                Some(session) if now < session.created_at() + lifetime => {
                    if let Err(e) = session.send_keep_alive(&mut self.ctx) {
                        tracing::debug!("Keep-alive to introducer {} failed: {}", endpoint, e);
                    }
                    retained.push(*endpoint);
                }
                _ => {
                    tracing::info!("Introducer {} expired", endpoint);
                    self.ctx.router.remove_introducer(*endpoint);
                }
            }
        }

        let max = self.settings.max_introducers;
        if retained.len() < max {
            for endpoint in self.find_introducers(max - retained.len(), &retained, now) {
                let Some(session) = self.sessions.get(&endpoint) else {
                    continue;
                };
                let Some(key) = session.intro_key() else {
                    continue;
                };
                let introducer = Introducer {
                    host: endpoint.ip(),
                    port: endpoint.port(),
                    tag: session.relay_tag(),
                    key,
                };
                if self.ctx.router.add_introducer(introducer) {
                    retained.push(endpoint);
                }
            }
        }

        if retained != previous {
            self.ctx.emit(SessionEvent::IntroducersUpdated {
                introducers: retained.clone(),
            });
        }
        self.introducers = retained;
    }

    /// Up to `count` random established sessions that handed us a relay tag
    /// and are still young enough to serve as introducers
    pub fn find_introducers(
        &self,
        count: usize,
        excluded: &[SocketAddr],
        now: Instant,
    ) -> Vec<SocketAddr> {
        let lifetime = self.settings.introducer_lifetime;
        self.sessions
            .values()
            .filter(|s| {
                s.relay_tag() != 0
                    && s.is_established()
                    && !excluded.contains(&s.endpoint())
                    && now < s.created_at() + lifetime
            })
            .map(Session::endpoint)
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Uniformly random established session other than `excluded`
    pub fn random_established_session(&self, excluded: Option<SocketAddr>) -> Option<SocketAddr> {
        self.sessions
            .values()
            .filter(|s| s.is_established() && Some(s.endpoint()) != excluded)
            .map(Session::endpoint)
            .choose(&mut rand::thread_rng())
    }

    pub fn session(&self, endpoint: &SocketAddr) -> Option<&Session> {
        self.sessions.get(endpoint)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(Session::info).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn relay_endpoint(&self, tag: u32) -> Option<SocketAddr> {
        self.relays.get(&tag).copied()
    }

    pub fn introducers(&self) -> &[SocketAddr] {
        &self.introducers
    }

    pub fn router(&self) -> &dyn RouterContext {
        self.ctx.router()
    }

    pub fn drain_outbox(&mut self) -> Vec<Transmit> {
        self.ctx.drain_outbox()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.ctx.drain_events()
    }

    fn handle_result(&mut self, endpoint: SocketAddr, result: Result<(), SsuError>) {
        let Err(e) = result else {
            return;
        };
        if !e.is_fatal() {
            tracing::debug!("Dropped datagram from {}: {}", endpoint, e);
            return;
        }
        tracing::warn!("SSU session with {} failed: {}", endpoint, e);
        let reason = match e {
            SsuError::Protocol(ProtocolError::MacVerificationFailed) => {
                TerminationReason::AuthenticationFailed
            }
            _ => TerminationReason::HandshakeFailed,
        };
        self.terminate(endpoint, reason);
    }

    /// The single teardown path
    fn terminate(&mut self, endpoint: SocketAddr, reason: TerminationReason) {
        let Some(mut session) = self.sessions.remove(&endpoint) else {
            return;
        };
        session.close(&mut self.ctx);
        self.relays.retain(|_, e| *e != endpoint);

        tracing::info!("SSU session with {} terminated: {:?}", endpoint, reason);
        self.ctx.emit(SessionEvent::Terminated {
            peer: endpoint,
            reason,
        });
    }

    fn run_followups(&mut self) {
        loop {
            let followups = self.ctx.take_followups();
            if followups.is_empty() {
                return;
            }
            for followup in followups {
                self.execute(followup);
            }
        }
    }

    fn execute(&mut self, followup: Followup) {
        match followup {
            Followup::RegisterRelay { tag, endpoint } => {
                tracing::debug!("Relay tag {} registered for {}", tag, endpoint);
                self.relays.insert(tag, endpoint);
            }
            Followup::Relay { from, request } => self.relay(from, request),
            Followup::PeerTestToCharlie { from, test } => self.peer_test_to_charlie(from, test),
            Followup::PeerTestToAlice { test } => self.peer_test_to_alice(test),
            Followup::Terminate { endpoint, reason } => self.terminate(endpoint, reason),
        }
    }

    /// Introducer side of a RelayRequest received from `from`
    fn relay(&mut self, from: SocketAddr, request: RelayRequest) {
        let Some(initiator) = self.relays.get(&request.relay_tag).copied() else {
            tracing::debug!("Unknown relay tag {} from {}", request.relay_tag, from);
            return;
        };
        if !self.sessions.contains_key(&initiator) {
            self.relays.remove(&request.relay_tag);
            return;
        }

        if let Some(session) = self.sessions.get_mut(&from) {
            let result = session.send_relay_response(
                initiator,
                from,
                request.nonce,
                &request.intro_key,
                &mut self.ctx,
            );
            self.handle_result(from, result);
        }
        if let Some(session) = self.sessions.get_mut(&initiator) {
            let result = session.send_relay_intro(from, &mut self.ctx);
            self.handle_result(initiator, result);
        }
    }

    /// Bob: pass Alice's test on to a random Charlie
    fn peer_test_to_charlie(&mut self, from: SocketAddr, test: PeerTest) {
        let Some(charlie) = self.random_established_session(Some(from)) else {
            tracing::debug!("No Charlie for PeerTest {} from {}", test.nonce, from);
            return;
        };
        let Some(session) = self.sessions.get_mut(&charlie) else {
            return;
        };
        session.add_peer_test_nonce(test.nonce);
        let result = session.relay_peer_test(&test, &mut self.ctx);
        self.handle_result(charlie, result);
    }

    /// Bob: Charlie reported back, tell Alice
    fn peer_test_to_alice(&mut self, test: PeerTest) {
        let Some(ip) = test.address else {
            return;
        };
        let alice = SocketAddr::new(ip, test.port);
        let Some(session) = self.sessions.get_mut(&alice) else {
            tracing::debug!("PeerTest {}: no session with Alice {}", test.nonce, alice);
            return;
        };
        session.remove_peer_test_nonce(test.nonce);
        let result = session.relay_peer_test(&test, &mut self.ctx);
        self.handle_result(alice, result);
    }
}
