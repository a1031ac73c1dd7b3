//! Two transports talking over real loopback sockets

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ssu_transport::{
    server, ChannelDelivery, LocalRouter, OsDhKeySource, RegistrySettings, RouterAddress,
    RouterInfo, ServerHandle, SessionEvent, SessionRegistry, SessionState, SsuError, SsuServer,
    TerminationReason,
};

const WAIT: Duration = Duration::from_secs(10);

struct Peer {
    addr: SocketAddr,
    info: RouterInfo,
    handle: ServerHandle,
    events: mpsc::Receiver<SessionEvent>,
    messages: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    task: JoinHandle<Result<(), SsuError>>,
}

async fn spawn_peer(intro_key: u8) -> anyhow::Result<Peer> {
    let socket = server::bind("127.0.0.1:0".parse()?).await?;
    let addr = socket.local_addr()?;

    let router = LocalRouter::generate(Some(RouterAddress::new(addr, [intro_key; 32])));
    let info = router.router_info();
    let (delivery, messages) = ChannelDelivery::new();
    let registry = SessionRegistry::new(
        Box::new(router),
        Box::new(OsDhKeySource),
        Box::new(delivery),
        RegistrySettings::default(),
    );

    let (event_tx, events) = mpsc::channel(64);
    let (server, handle) = SsuServer::new(socket, registry);
    let task = tokio::spawn(server.with_events(event_tx).run());

    Ok(Peer {
        addr,
        info,
        handle,
        events,
        messages,
        task,
    })
}

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await?;
    found.ok_or_else(|| anyhow::anyhow!("event stream closed"))
}

#[tokio::test]
async fn test_loopback_session() -> anyhow::Result<()> {
    let mut alice = spawn_peer(0x11).await?;
    let mut bob = spawn_peer(0x22).await?;

    let endpoint = alice.handle.connect(bob.info.clone(), false).await?;
    assert_eq!(endpoint, bob.addr);

    // Queued until the handshake completes
    alice
        .handle
        .send(bob.addr, Bytes::from_static(b"hello over ssu"))
        .await?;

    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::Established { initiator: true, .. })
    })
    .await?;
    wait_for(&mut bob.events, |e| {
        matches!(e, SessionEvent::Established { initiator: false, .. })
    })
    .await?;

    let (from, message) = timeout(WAIT, bob.messages.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("delivery channel closed"))?;
    assert_eq!(from, alice.addr);
    assert_eq!(message, Bytes::from_static(b"hello over ssu"));

    let sessions = alice.handle.sessions().await?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].endpoint, bob.addr);
    assert_eq!(sessions[0].state, SessionState::Established);
    assert!(sessions[0].sent_bytes > 0);

    // Shutting Alice down tells Bob
    alice.handle.shutdown().await?;
    alice.task.await??;
    let event = wait_for(&mut bob.events, |e| matches!(e, SessionEvent::Terminated { .. })).await?;
    assert_eq!(
        event,
        SessionEvent::Terminated {
            peer: alice.addr,
            reason: TerminationReason::PeerDestroyed
        }
    );

    bob.handle.shutdown().await?;
    bob.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_handle_after_shutdown() -> anyhow::Result<()> {
    let peer = spawn_peer(0x33).await?;
    peer.handle.shutdown().await?;
    peer.task.await??;

    assert!(peer.handle.sessions().await.is_err());
    Ok(())
}
