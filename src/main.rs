//! ssud - SSU transport daemon
//!
//! Binds the transport socket described by the configuration file, connects
//! to the configured peers and reports session events until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use ssu_transport::error::NetworkError;
use ssu_transport::{
    server, ChannelDelivery, LocalRouter, OsDhKeySource, RouterContext, SessionEvent,
    SessionRegistry, SsuConfig, SsuError, SsuServer,
};

/// Pending events before the event printer falls behind
const EVENT_QUEUE: usize = 1024;

/// ssud - secure semi-reliable UDP transport daemon
#[derive(Parser, Debug)]
#[command(name = "ssud")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print session events to stdout as JSON lines
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), SsuError> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = SsuConfig::from_file(&args.config)?;
    let transport = &config.transport;

    let socket = server::bind(transport.listen_addr()).await?;
    let bound = socket.local_addr()?;

    let router = LocalRouter::from_seed(&transport.private_key, Some(transport.published_address(bound)))
        .with_introducer(transport.introducer)
        .with_unreachable(transport.unreachable);
    tracing::info!("Router identity: {}", BASE64.encode(router.identity()));

    let (delivery, mut messages) = ChannelDelivery::new();
    let registry = SessionRegistry::new(
        Box::new(router),
        Box::new(OsDhKeySource),
        Box::new(delivery),
        transport.registry_settings(),
    );

    let (event_tx, mut events) = mpsc::channel(EVENT_QUEUE);
    let (server, handle) = SsuServer::new(socket, registry);
    let mut server_task = tokio::spawn(server.with_events(event_tx).run());

    let json_events = args.json_events;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            report(&event, json_events);
        }
    });

    tokio::spawn(async move {
        while let Some((peer, message)) = messages.recv().await {
            tracing::info!("Received {} byte message from {}", message.len(), peer);
        }
    });

    for peer in &config.peers {
        let info = match peer.router_info() {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Skipping peer: {}", e);
                continue;
            }
        };
        let peer_test = peer.peer_test && transport.peer_testing;
        if let Err(e) = handle.connect(info, peer_test).await {
            tracing::warn!("Failed to connect to peer: {}", e.user_message());
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = &mut server_task => {
            return result.map_err(|_| NetworkError::ServerStopped)?;
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    handle.shutdown().await?;
    server_task.await.map_err(|_| NetworkError::ServerStopped)?
}

fn report(event: &SessionEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        }
        return;
    }

    match event {
        SessionEvent::Established { peer, initiator } => {
            let side = if *initiator { "outbound" } else { "inbound" };
            tracing::info!("Session with {} established ({})", peer, side);
        }
        SessionEvent::Terminated { peer, reason } => {
            tracing::info!("Session with {} terminated: {:?}", peer, reason);
        }
        SessionEvent::ExternalAddress { peer, address } => {
            tracing::info!("{} sees us at {}", peer, address);
        }
        SessionEvent::PeerTestCompleted {
            peer,
            nonce,
            external,
            direct,
        } => {
            tracing::info!(
                "Peer test {} via {}: external {:?} direct={}",
                nonce,
                peer,
                external,
                direct
            );
        }
        SessionEvent::IntroducersUpdated { introducers } => {
            tracing::info!("Publishing {} introducers: {:?}", introducers.len(), introducers);
        }
    }
}
