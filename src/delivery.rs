//! Delivery layer boundary
//!
//! Reliable delivery and fragmentation sit above the transport. The
//! transport hands decrypted Data payloads up through [`DeliveryLayer`] and
//! asks it to turn outbound messages into Data payloads.
//!
//! [`ChannelDelivery`] is a minimal implementation: every message travels
//! as a single fragment and received messages are pushed onto a tokio
//! channel. Data payload layout:
//!
//! ```text
//! flags(1) | fragments(1) | { msg id(4) | info(3) | data } ...
//! info: fragment number(7) | last(1) | unused(2) | size(14)
//! ```

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

/// Upper layer that owns Data payload semantics
pub trait DeliveryLayer: Send {
    /// Decrypted Data payload from an established session
    fn process_message(&mut self, peer: SocketAddr, payload: &[u8]);

    /// Split an outbound message into Data payloads
    fn fragment(&mut self, peer: SocketAddr, message: &Bytes) -> Vec<Vec<u8>>;

    /// Messages that were queued for a session that has been torn down
    fn undelivered(&mut self, peer: SocketAddr, messages: Vec<Bytes>);
}

/// Largest message sent as a single fragment
pub const MAX_MESSAGE_SIZE: usize = 1400;

const FRAGMENT_HEADER_SIZE: usize = 7;
const LAST_FRAGMENT: u32 = 1 << 16;
const SIZE_MASK: u32 = 0x3fff;

/// Single-fragment delivery that forwards received messages over a channel
pub struct ChannelDelivery {
    inbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    next_message_id: u32,
}

impl ChannelDelivery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: tx,
                next_message_id: rand::random(),
            },
            rx,
        )
    }
}

impl DeliveryLayer for ChannelDelivery {
    fn process_message(&mut self, peer: SocketAddr, payload: &[u8]) {
        let mut buf = payload;
        if buf.remaining() < 2 {
            tracing::debug!("Short Data payload from {}", peer);
            return;
        }

        let flags = buf.get_u8();
        if flags != 0 {
            tracing::debug!("Ignoring Data flags {:#04x} from {}", flags, peer);
            return;
        }

        let fragments = buf.get_u8();
        if fragments == 0 {
            tracing::trace!("Keep-alive from {}", peer);
            return;
        }

        for _ in 0..fragments {
            if buf.remaining() < FRAGMENT_HEADER_SIZE {
                tracing::warn!("Truncated fragment header from {}", peer);
                return;
            }
            let message_id = buf.get_u32();
            let info = (buf.get_u8() as u32) << 16 | buf.get_u16() as u32;
            let size = (info & SIZE_MASK) as usize;
            if buf.remaining() < size {
                tracing::warn!("Truncated fragment {} from {}", message_id, peer);
                return;
            }
            let data = Bytes::copy_from_slice(&buf[..size]);
            buf.advance(size);

            if info >> 17 != 0 || info & LAST_FRAGMENT == 0 {
                tracing::warn!("Multi-fragment message {} from {} not supported", message_id, peer);
                continue;
            }
            if self.inbound.send((peer, data)).is_err() {
                tracing::debug!("Message receiver dropped");
                return;
            }
        }
    }

    fn fragment(&mut self, peer: SocketAddr, message: &Bytes) -> Vec<Vec<u8>> {
        if message.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(
                "Dropping {} byte message to {}: exceeds {} bytes",
                message.len(),
                peer,
                MAX_MESSAGE_SIZE
            );
            return Vec::new();
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let info = LAST_FRAGMENT | message.len() as u32;
        let mut buf = BytesMut::with_capacity(2 + FRAGMENT_HEADER_SIZE + message.len());
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_u32(message_id);
        buf.put_u8((info >> 16) as u8);
        buf.put_u16(info as u16);
        buf.put_slice(message);
        vec![buf.to_vec()]
    }

    fn undelivered(&mut self, peer: SocketAddr, messages: Vec<Bytes>) {
        if !messages.is_empty() {
            tracing::warn!("Dropped {} queued messages for {}", messages.len(), peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[test]
    fn test_fragment_then_deliver() {
        let (mut delivery, mut rx) = ChannelDelivery::new();
        let message = Bytes::from_static(b"database store");

        let payloads = delivery.fragment(peer(), &message);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), 2 + FRAGMENT_HEADER_SIZE + message.len());

        // Cipher padding after the payload is ignored
        let mut padded = payloads[0].clone();
        padded.extend_from_slice(&[0u8; 5]);
        delivery.process_message(peer(), &padded);

        let (from, received) = rx.try_recv().unwrap();
        assert_eq!(from, peer());
        assert_eq!(received, message);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_keep_alive_not_delivered() {
        let (mut delivery, mut rx) = ChannelDelivery::new();
        delivery.process_message(peer(), &[0, 0, 0, 0]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_oversized_message_dropped() {
        let (mut delivery, _rx) = ChannelDelivery::new();
        let message = Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert!(delivery.fragment(peer(), &message).is_empty());
    }

    #[test]
    fn test_truncated_fragment_ignored() {
        let (mut delivery, mut rx) = ChannelDelivery::new();
        let payloads = delivery.fragment(peer(), &Bytes::from_static(b"hello"));
        delivery.process_message(peer(), &payloads[0][..payloads[0].len() - 2]);
        assert!(rx.try_recv().is_err());
    }
}
