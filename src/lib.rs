//! SSU - secure semi-reliable UDP transport
//!
//! An authenticated, encrypted datagram transport between overlay routers,
//! with NAT traversal through introducers.
//!
//! # Features
//!
//! - Three-message handshake with 2048-bit Diffie-Hellman and signed transcripts
//! - AES-256-CBC datagram encryption with HMAC-MD5 authentication
//! - Introductions through relay tags and hole punching
//! - Peer tests for external address discovery
//! - Connect and idle timeouts, introducer refresh
//!
//! # Usage
//!
//! ```no_run
//! use ssu_transport::{
//!     server, ChannelDelivery, LocalRouter, OsDhKeySource, RegistrySettings, RouterAddress,
//!     SessionRegistry, SsuServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ssu_transport::SsuError> {
//!     let socket = server::bind("0.0.0.0:12345".parse().unwrap()).await?;
//!     let address = RouterAddress::new(socket.local_addr()?, [7u8; 32]);
//!     let (delivery, _messages) = ChannelDelivery::new();
//!     let registry = SessionRegistry::new(
//!         Box::new(LocalRouter::generate(Some(address))),
//!         Box::new(OsDhKeySource),
//!         Box::new(delivery),
//!         RegistrySettings::default(),
//!     );
//!     let (server, _handle) = SsuServer::new(socket, registry);
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use config::SsuConfig;
pub use crypto::{DhKeyPair, DhKeySource, OsDhKeySource};
pub use delivery::{ChannelDelivery, DeliveryLayer};
pub use error::SsuError;
pub use protocol::{SessionEvent, SessionInfo, SessionState, TerminationReason};
pub use registry::{RegistrySettings, SessionRegistry};
pub use router::{Introducer, LocalRouter, RouterAddress, RouterContext, RouterInfo};
pub use server::{Command, ServerHandle, SsuServer};
