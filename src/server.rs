//! SSU server event loop
//!
//! Owns the UDP socket and the [`SessionRegistry`] and drives both from a
//! single task:
//! - Receiving datagrams and handing them to the registry
//! - Commands from other parts of the process through [`ServerHandle`]
//! - Session and introducer timers
//! - Flushing outbound datagrams and events after every step

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::{NetworkError, SsuError};
use crate::protocol::context::SessionEvent;
use crate::protocol::session::SessionInfo;
use crate::registry::SessionRegistry;
use crate::router::RouterInfo;

/// Buffer size for received datagrams
const BUFFER_SIZE: usize = 65535;

/// Kernel socket buffer size
const SOCKET_BUFFER_SIZE: usize = 65536;

/// Pending commands before senders wait
const COMMAND_QUEUE: usize = 256;

/// Requests handled by the event loop
#[derive(Debug)]
pub enum Command {
    /// Open a session to a router
    Connect {
        router: RouterInfo,
        peer_test: bool,
        reply: oneshot::Sender<Result<SocketAddr, SsuError>>,
    },
    /// Send an application message to a peer
    Send { peer: SocketAddr, message: Bytes },
    /// Tear down the session with a peer
    Close { peer: SocketAddr },
    /// Snapshot of every session
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    /// Close every session and stop the loop
    Shutdown,
}

/// Cloneable handle to a running [`SsuServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<Command>,
}

impl ServerHandle {
    async fn submit(&self, command: Command) -> Result<(), SsuError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::ServerStopped.into())
    }

    pub async fn connect(&self, router: RouterInfo, peer_test: bool) -> Result<SocketAddr, SsuError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Connect {
            router,
            peer_test,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NetworkError::ServerStopped)?
    }

    pub async fn send(&self, peer: SocketAddr, message: Bytes) -> Result<(), SsuError> {
        self.submit(Command::Send { peer, message }).await
    }

    pub async fn close(&self, peer: SocketAddr) -> Result<(), SsuError> {
        self.submit(Command::Close { peer }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, SsuError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Sessions { reply }).await?;
        Ok(rx.await.map_err(|_| NetworkError::ServerStopped)?)
    }

    pub async fn shutdown(&self) -> Result<(), SsuError> {
        self.submit(Command::Shutdown).await
    }
}

/// Bind the transport socket with enlarged kernel buffers
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, SsuError> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    let sock = SockRef::from(&socket);
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("Failed to set receive buffer size: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("Failed to set send buffer size: {}", e);
    }
    Ok(socket)
}

/// SSU transport server
pub struct SsuServer {
    socket: UdpSocket,
    registry: SessionRegistry,
    commands: mpsc::Receiver<Command>,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl SsuServer {
    pub fn new(socket: UdpSocket, registry: SessionRegistry) -> (Self, ServerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let server = Self {
            socket,
            registry,
            commands: rx,
            events: None,
        };
        (server, ServerHandle { commands: tx })
    }

    /// Forward session events to `events`
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SsuError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run until [`Command::Shutdown`] or every handle is dropped
    pub async fn run(mut self) -> Result<(), SsuError> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        tracing::info!("SSU server listening on {}", self.local_addr()?);

        loop {
            let deadline = tokio::time::Instant::from_std(self.registry.next_deadline());

            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.registry.process_datagram(&mut buf[..len], from),
                        // ICMP errors from earlier sends surface here on some platforms
                        Err(e) => tracing::debug!("UDP recv error: {}", e),
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            tracing::info!("SSU server shutting down");
                            self.registry.close_all();
                            self.flush().await;
                            return Ok(());
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    self.registry.handle_timers(Instant::now());
                }
            }

            self.flush().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                router,
                peer_test,
                reply,
            } => {
                let result = self.registry.connect(router, peer_test);
                if let Err(e) = &result {
                    tracing::warn!("Connect failed: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Send { peer, message } => {
                if let Err(e) = self.registry.send(peer, message) {
                    tracing::warn!("Send to {} failed: {}", peer, e);
                }
            }
            Command::Close { peer } => self.registry.close(peer),
            Command::Sessions { reply } => {
                let _ = reply.send(self.registry.sessions());
            }
            Command::Shutdown => {}
        }
    }

    async fn flush(&mut self) {
        for transmit in self.registry.drain_outbox() {
            if let Err(e) = self.socket.send_to(&transmit.payload, transmit.to).await {
                tracing::warn!("SSU send to {} failed: {}", transmit.to, e);
            }
        }

        let events = self.registry.drain_events();
        let Some(tx) = self.events.as_ref() else {
            return;
        };
        for event in events {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::warn!("Event receiver lagging, dropped {:?}", event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Event receiver dropped");
                    self.events = None;
                    return;
                }
            }
        }
    }
}
