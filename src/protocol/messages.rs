//! SSU message wire formats
//!
//! Every datagram starts with the same 37-byte header:
//!
//! ```text
//! iv(16) | mac(16) | flags(1) | time(4, BE seconds) | body...
//! ```
//!
//! Everything from `flags` onward is AES-256-CBC encrypted; the high nibble
//! of `flags` carries the payload type. Bodies by payload type:
//! - 0 SessionRequest:   X(256) | size(1) | responder ip
//! - 1 SessionCreated:   Y(256) | size(1) | initiator ip | port(2) | relay tag(4) | time(4) | encrypted signature
//! - 2 SessionConfirmed: info(1) | ident len(2) | ident | time(4) | padding | signature
//! - 3 RelayRequest:     tag(4) | size(1) | ip | port(2) | challenge size(1) | challenge | intro key(32) | nonce(4)
//! - 4 RelayResponse:    size(1) | initiator ip | port(2) | size(1) | target ip | port(2) | nonce(4)
//! - 5 RelayIntro:       size(1) | target ip | port(2) | challenge size(1) | challenge
//! - 6 Data:             opaque, owned by the delivery layer
//! - 7 PeerTest:         nonce(4) | size(1) | ip | port(2) | intro key(32)
//! - 8 SessionDestroyed: empty

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use crate::crypto::dh::DH_KEY_LEN;
use crate::error::ProtocolError;

/// CBC initialization vector length
pub const IV_SIZE: usize = 16;

/// HMAC-MD5 tag length
pub const MAC_SIZE: usize = 16;

/// Offset of the encrypted region (the flags byte)
pub const ENCRYPTED_OFFSET: usize = IV_SIZE + MAC_SIZE;

/// Full header: iv, mac, flags, timestamp
pub const HEADER_SIZE: usize = ENCRYPTED_OFFSET + 1 + 4;

/// Intro, session and MAC key length
pub const KEY_SIZE: usize = 32;

/// Largest datagram sent to an IPv4 peer
pub const MTU_V4: usize = 1484;

/// Largest datagram sent to an IPv6 peer
pub const MTU_V6: usize = 1472;

/// MTU for a given peer endpoint
pub fn mtu_for(endpoint: &SocketAddr) -> usize {
    match endpoint {
        SocketAddr::V4(_) => MTU_V4,
        SocketAddr::V6(_) => MTU_V6,
    }
}

/// SSU payload types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    SessionRequest = 0,
    SessionCreated = 1,
    SessionConfirmed = 2,
    RelayRequest = 3,
    RelayResponse = 4,
    RelayIntro = 5,
    Data = 6,
    PeerTest = 7,
    SessionDestroyed = 8,
}

impl TryFrom<u8> for PayloadType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SessionRequest),
            1 => Ok(Self::SessionCreated),
            2 => Ok(Self::SessionConfirmed),
            3 => Ok(Self::RelayRequest),
            4 => Ok(Self::RelayResponse),
            5 => Ok(Self::RelayIntro),
            6 => Ok(Self::Data),
            7 => Ok(Self::PeerTest),
            8 => Ok(Self::SessionDestroyed),
            _ => Err(ProtocolError::InvalidPayloadType {
                payload_type: value,
            }),
        }
    }
}

/// Decrypted datagram header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub iv: [u8; IV_SIZE],
    pub mac: [u8; MAC_SIZE],
    pub flags: u8,
    pub timestamp: u32,
}

impl Header {
    /// Parse the header of a decrypted datagram
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[..IV_SIZE]);
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&data[IV_SIZE..ENCRYPTED_OFFSET]);
        let flags = data[ENCRYPTED_OFFSET];
        let mut time = &data[ENCRYPTED_OFFSET + 1..HEADER_SIZE];

        Ok(Self {
            iv,
            mac,
            flags,
            timestamp: time.get_u32(),
        })
    }

    /// Payload type from the high nibble of the flags byte
    pub fn payload_type(&self) -> Result<PayloadType, ProtocolError> {
        PayloadType::try_from(self.flags >> 4)
    }
}

/// Bounds-checked reader over a message body
struct Reader<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            len: buf.len(),
        }
    }

    fn position(&self) -> usize {
        self.len - self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::InvalidMessageLength {
                expected: self.position() + n,
                got: self.len,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// Size-prefixed address; size 0 means "no address"
    fn address(&mut self) -> Result<Option<IpAddr>, ProtocolError> {
        let size = self.u8()? as usize;
        match size {
            0 => Ok(None),
            4 => Ok(Some(IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)))),
            16 => Ok(Some(IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)))),
            _ => Err(ProtocolError::UnsupportedAddressFamily { size }),
        }
    }

    /// Size-prefixed address followed by a port, address required
    fn endpoint(&mut self) -> Result<SocketAddr, ProtocolError> {
        let ip = self
            .address()?
            .ok_or(ProtocolError::UnsupportedAddressFamily { size: 0 })?;
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }
}

fn put_address(buf: &mut BytesMut, address: Option<IpAddr>) {
    match address {
        None => buf.put_u8(0),
        Some(IpAddr::V4(ip)) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            buf.put_u8(16);
            buf.put_slice(&ip.octets());
        }
    }
}

fn put_endpoint(buf: &mut BytesMut, endpoint: SocketAddr) {
    put_address(buf, Some(endpoint.ip()));
    buf.put_u16(endpoint.port());
}

/// Raw address bytes, as they appear in signed handshake data
pub fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

/// SessionRequest: initiator's DH public value and the responder address it dialled
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub x: [u8; DH_KEY_LEN],
    pub address: Option<IpAddr>,
}

impl SessionRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DH_KEY_LEN + 17);
        buf.put_slice(&self.x);
        put_address(&mut buf, self.address);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            x: r.array()?,
            address: r.address()?,
        })
    }
}

/// SessionCreated: responder's DH public value and its view of the initiator
#[derive(Debug, Clone)]
pub struct SessionCreated {
    pub y: [u8; DH_KEY_LEN],
    /// Initiator's endpoint as the responder sees it
    pub observed: SocketAddr,
    pub relay_tag: u32,
    pub signed_on: u32,
    /// Signature padded to the block size and encrypted under the new session key
    pub encrypted_signature: Vec<u8>,
}

impl SessionCreated {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DH_KEY_LEN + 27 + self.encrypted_signature.len());
        buf.put_slice(&self.y);
        put_endpoint(&mut buf, self.observed);
        buf.put_u32(self.relay_tag);
        buf.put_u32(self.signed_on);
        buf.put_slice(&self.encrypted_signature);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            y: r.array()?,
            observed: r.endpoint()?,
            relay_tag: r.u32()?,
            signed_on: r.u32()?,
            encrypted_signature: r.rest().to_vec(),
        })
    }
}

/// SessionConfirmed: initiator's identity and its signature over the handshake
#[derive(Debug, Clone)]
pub struct SessionConfirmed {
    pub identity: Vec<u8>,
    pub signed_on: u32,
    /// Zero padding followed by the signature
    pub trailer: Vec<u8>,
}

impl SessionConfirmed {
    /// Single fragment, fragment number 0
    const FRAGMENT_INFO: u8 = 0x01;

    pub fn new(identity: Vec<u8>, signed_on: u32, signature: &[u8]) -> Self {
        let fixed = Self::fixed_len(identity.len());
        let padding = Self::padding(fixed, signature.len());
        let mut trailer = vec![0u8; padding];
        trailer.extend_from_slice(signature);
        Self {
            identity,
            signed_on,
            trailer,
        }
    }

    /// Datagram length up to the end of the timestamp
    fn fixed_len(identity_len: usize) -> usize {
        HEADER_SIZE + 1 + 2 + identity_len + 4
    }

    /// Padding that makes the whole datagram a multiple of 16 bytes
    fn padding(fixed: usize, signature_len: usize) -> usize {
        (16 - (fixed + signature_len) % 16) % 16
    }

    /// Extract the signature given the signer's signature length
    pub fn signature(&self, signature_len: usize) -> Option<&[u8]> {
        let padding = Self::padding(Self::fixed_len(self.identity.len()), signature_len);
        self.trailer.get(padding..padding + signature_len)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(7 + self.identity.len() + self.trailer.len());
        buf.put_u8(Self::FRAGMENT_INFO);
        buf.put_u16(self.identity.len() as u16);
        buf.put_slice(&self.identity);
        buf.put_u32(self.signed_on);
        buf.put_slice(&self.trailer);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let _info = r.u8()?;
        let identity_len = r.u16()? as usize;
        Ok(Self {
            identity: r.bytes(identity_len)?.to_vec(),
            signed_on: r.u32()?,
            trailer: r.rest().to_vec(),
        })
    }
}

/// RelayRequest: ask an introducer to broker a connection to a relay tag
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub relay_tag: u32,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub challenge: Vec<u8>,
    /// Requester's intro key, used to seal the RelayResponse
    pub intro_key: [u8; KEY_SIZE],
    pub nonce: u32,
}

impl RelayRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(self.relay_tag);
        put_address(&mut buf, self.address);
        buf.put_u16(self.port);
        buf.put_u8(self.challenge.len() as u8);
        buf.put_slice(&self.challenge);
        buf.put_slice(&self.intro_key);
        buf.put_u32(self.nonce);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let relay_tag = r.u32()?;
        let address = r.address()?;
        let port = r.u16()?;
        let challenge_len = r.u8()? as usize;
        Ok(Self {
            relay_tag,
            address,
            port,
            challenge: r.bytes(challenge_len)?.to_vec(),
            intro_key: r.array()?,
            nonce: r.u32()?,
        })
    }
}

/// RelayResponse: introducer tells the requester where the tagged peer is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    /// Endpoint of the peer that registered the tag
    pub initiator: SocketAddr,
    /// Requester's endpoint as the introducer sees it
    pub target: SocketAddr,
    pub nonce: u32,
}

impl RelayResponse {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(48);
        put_endpoint(&mut buf, self.initiator);
        put_endpoint(&mut buf, self.target);
        buf.put_u32(self.nonce);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            initiator: r.endpoint()?,
            target: r.endpoint()?,
            nonce: r.u32()?,
        })
    }
}

/// RelayIntro: introducer tells the tagged peer to punch a hole towards the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIntro {
    pub target: SocketAddr,
    pub challenge: Vec<u8>,
}

impl RelayIntro {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        put_endpoint(&mut buf, self.target);
        buf.put_u8(self.challenge.len() as u8);
        buf.put_slice(&self.challenge);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let target = r.endpoint()?;
        let challenge_len = r.u8()? as usize;
        Ok(Self {
            target,
            challenge: r.bytes(challenge_len)?.to_vec(),
        })
    }
}

/// PeerTest: reachability probe passed between Alice, Bob and Charlie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTest {
    pub nonce: u32,
    /// Alice's address, absent in Alice's own request
    pub address: Option<IpAddr>,
    pub port: u16,
    /// Alice's intro key
    pub intro_key: [u8; KEY_SIZE],
}

impl PeerTest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_u32(self.nonce);
        put_address(&mut buf, self.address);
        buf.put_u16(self.port);
        buf.put_slice(&self.intro_key);
        buf
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            nonce: r.u32()?,
            address: r.address()?,
            port: r.u16()?,
            intro_key: r.array()?,
        })
    }
}

/// A decoded SSU message body
#[derive(Debug, Clone)]
pub enum Message {
    SessionRequest(SessionRequest),
    SessionCreated(SessionCreated),
    SessionConfirmed(SessionConfirmed),
    RelayRequest(RelayRequest),
    RelayResponse(RelayResponse),
    RelayIntro(RelayIntro),
    Data(Vec<u8>),
    PeerTest(PeerTest),
    SessionDestroyed,
}

impl Message {
    /// Decode a decrypted body (everything after the header)
    pub fn decode(payload_type: PayloadType, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let message = match payload_type {
            PayloadType::SessionRequest => Self::SessionRequest(SessionRequest::decode(&mut r)?),
            PayloadType::SessionCreated => Self::SessionCreated(SessionCreated::decode(&mut r)?),
            PayloadType::SessionConfirmed => {
                Self::SessionConfirmed(SessionConfirmed::decode(&mut r)?)
            }
            PayloadType::RelayRequest => Self::RelayRequest(RelayRequest::decode(&mut r)?),
            PayloadType::RelayResponse => Self::RelayResponse(RelayResponse::decode(&mut r)?),
            PayloadType::RelayIntro => Self::RelayIntro(RelayIntro::decode(&mut r)?),
            PayloadType::Data => Self::Data(r.rest().to_vec()),
            PayloadType::PeerTest => Self::PeerTest(PeerTest::decode(&mut r)?),
            PayloadType::SessionDestroyed => Self::SessionDestroyed,
        };
        Ok(message)
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::SessionRequest(_) => PayloadType::SessionRequest,
            Self::SessionCreated(_) => PayloadType::SessionCreated,
            Self::SessionConfirmed(_) => PayloadType::SessionConfirmed,
            Self::RelayRequest(_) => PayloadType::RelayRequest,
            Self::RelayResponse(_) => PayloadType::RelayResponse,
            Self::RelayIntro(_) => PayloadType::RelayIntro,
            Self::Data(_) => PayloadType::Data,
            Self::PeerTest(_) => PayloadType::PeerTest,
            Self::SessionDestroyed => PayloadType::SessionDestroyed,
        }
    }
}
