//! Introduction and peer test messages
//!
//! Introduction lets a Target reach an Initiator behind NAT through an
//! Introducer that holds an established session with the Initiator:
//!
//! ```text
//! Target --RelayRequest(tag)--> Introducer --RelayIntro--> Initiator
//! Target <--RelayResponse------ Introducer
//! Target <--------------(empty hole punch)---------------- Initiator
//! ```
//!
//! Peer tests let Alice learn how she is seen from outside with the help of
//! Bob (an established peer) and Charlie (a peer Bob picks).

use std::net::SocketAddr;

use rand::{rngs::OsRng, RngCore};

use crate::error::{ProtocolError, SsuError};
use crate::protocol::codec::{self, PacketKeys};
use crate::protocol::messages::{
    PayloadType, PeerTest, RelayIntro, RelayRequest, RelayResponse, KEY_SIZE,
};

/// Random non-zero 32-bit value, used for relay tags and nonces
pub fn random_nonzero() -> u32 {
    loop {
        let value = OsRng.next_u32();
        if value != 0 {
            return value;
        }
    }
}

fn require_ipv4(endpoint: &SocketAddr) -> Result<(), ProtocolError> {
    if endpoint.is_ipv4() {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedAddressFamily { size: 16 })
    }
}

/// Target -> Introducer: ask for an introduction to `relay_tag`
pub fn create_relay_request(
    relay_tag: u32,
    intro_key: &[u8; KEY_SIZE],
    nonce: u32,
    keys: PacketKeys<'_>,
) -> Result<Vec<u8>, SsuError> {
    let request = RelayRequest {
        relay_tag,
        address: None,
        port: 0,
        challenge: Vec::new(),
        intro_key: *intro_key,
        nonce,
    };
    Ok(codec::seal_random(
        PayloadType::RelayRequest,
        &request.encode(),
        keys,
    )?)
}

/// Introducer -> Target: where the tagged Initiator lives
pub fn create_relay_response(
    initiator: SocketAddr,
    target: SocketAddr,
    nonce: u32,
    keys: PacketKeys<'_>,
) -> Result<Vec<u8>, SsuError> {
    require_ipv4(&initiator)?;
    let response = RelayResponse {
        initiator,
        target,
        nonce,
    };
    Ok(codec::seal_random(
        PayloadType::RelayResponse,
        &response.encode(),
        keys,
    )?)
}

/// Introducer -> Initiator: punch a hole towards `target`
pub fn create_relay_intro(target: SocketAddr, keys: PacketKeys<'_>) -> Result<Vec<u8>, SsuError> {
    require_ipv4(&target)?;
    let intro = RelayIntro {
        target,
        challenge: Vec::new(),
    };
    Ok(codec::seal_random(
        PayloadType::RelayIntro,
        &intro.encode(),
        keys,
    )?)
}

pub fn create_peer_test(test: &PeerTest, keys: PacketKeys<'_>) -> Result<Vec<u8>, SsuError> {
    Ok(codec::seal_random(
        PayloadType::PeerTest,
        &test.encode(),
        keys,
    )?)
}

/// Our part in a peer test, inferred from a received PeerTest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTestRole {
    /// We started the test and Bob answered
    AliceFromBob,
    /// Charlie answered us directly, outside any session we had
    AliceFromCharlie,
    /// Charlie reported back; forward to Alice
    BobFromCharlie,
    /// Alice asked us to run a test
    BobFromAlice,
    /// Bob picked us; answer Bob and Alice
    CharlieFromBob,
    /// Alice contacted us after Bob's introduction
    CharlieFromAlice,
}

impl PeerTestRole {
    /// `nonce_known`: the nonce is in this session's outstanding set.
    /// `initiated`: this session started a peer test.
    /// `port_set`: the message carries Alice's port.
    pub fn classify(nonce_known: bool, initiated: bool, port_set: bool, established: bool) -> Self {
        match (nonce_known, initiated, port_set, established) {
            (true, true, _, _) => Self::AliceFromBob,
            (true, false, true, _) => Self::BobFromCharlie,
            (true, false, false, _) => Self::CharlieFromAlice,
            (false, _, true, true) => Self::CharlieFromBob,
            (false, _, false, true) => Self::BobFromAlice,
            (false, _, _, false) => Self::AliceFromCharlie,
        }
    }
}
