//! `communicatord` — process-local and cluster-wide message broker daemon.
//!
//! This binary owns everything spec.md §1 keeps out of the core crate:
//! flag parsing, listener sockets, and process lifecycle. Accept loops
//! only ever hand a raw, not-yet-registered connection to the broker's
//! event loop (spec.md §5) — they never touch the registry themselves.

mod cli;

use std::sync::Arc;

use clap::Parser;
use communicatord_common::{Component, LogLevel, Logger, LoggingConfig};
use communicatord_core::address::HostKind;
use communicatord_core::config::{BrokerConfig, ListenerConfig, TlsMaterial};
use communicatord_core::registry::{Direction, Role};
use communicatord_core::transport::datagram::DatagramHandle;
use communicatord_core::transport::stream::RawStream;
use communicatord_core::transport::tls;
use communicatord_core::transport::PendingConnection;
use communicatord_core::Broker;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    LoggingConfig::new()
        .with_default_level(LogLevel::Info)
        .with_debug_all_messages(cli.debug_all_messages)
        .apply();

    let logger = Logger::new_root(Component::Broker, "communicatord");
    let config = cli.into_broker_config()?;
    std::fs::create_dir_all(&config.data_path)?;

    run_daemon(config, logger).await
}

async fn run_daemon(config: BrokerConfig, logger: Logger) -> anyhow::Result<()> {
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (incoming_tx, incoming_rx) = mpsc::channel(256);

    let listeners = config.listeners.clone();
    let signal_secret = config.signal_secret.clone();
    let broker = Broker::new(config, logger.clone())?;
    let server_name = broker.server_name().to_string();
    let signal_endpoint_id = broker.signal_endpoint_id();

    spawn_listeners(
        &listeners,
        signal_secret,
        signal_endpoint_id,
        incoming_tx.clone(),
        events_tx.clone(),
        logger.clone(),
    )
    .await?;

    let shutdown_logger = logger.with_context("signal");
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_logger.info("received interrupt, beginning graceful shutdown");
        }
    });

    logger.info(format!("{server_name} ready"));
    broker.run(events_tx, events_rx, incoming_tx, incoming_rx).await;
    Ok(())
}

/// Bind every listener the configuration names and spawn its accept loop.
async fn spawn_listeners(
    listeners: &ListenerConfig,
    signal_secret: Option<String>,
    signal_endpoint_id: Option<communicatord_core::registry::EndpointId>,
    incoming: mpsc::Sender<PendingConnection>,
    events: mpsc::Sender<(communicatord_core::registry::EndpointId, communicatord_core::transport::ConnectionEvent)>,
    logger: Logger,
) -> anyhow::Result<()> {
    if let Some(addr) = socket_addr(listeners.local_listen.as_ref()) {
        spawn_tcp_acceptor(addr, Role::LocalService, incoming.clone(), logger.with_context("local-listen")).await?;
    }
    if let Some(addr) = socket_addr(listeners.remote_listen.as_ref()) {
        spawn_tcp_acceptor(addr, Role::InboundPeer, incoming.clone(), logger.with_context("remote-listen")).await?;
    }
    if let Some(path) = unix_path(listeners.unix_listen.as_ref()) {
        spawn_unix_acceptor(path, incoming.clone(), logger.with_context("unix-listen")).await?;
    }
    if let Some((addr, material)) = secure_listener(listeners) {
        let certs = tls::load_certificates(&std::fs::read(&material.certificate_pem_path)?)?;
        let key = tls::load_private_key(&std::fs::read(&material.private_key_pem_path)?)?;
        let acceptor = tls::build_acceptor(certs, key)?;
        spawn_tls_acceptor(addr, acceptor, incoming.clone(), logger.with_context("secure-listen")).await?;
    }
    if let (Some(addr), Some(signal_id)) = (socket_addr(listeners.signal_listen.as_ref()), signal_endpoint_id) {
        let handle = Arc::new(DatagramHandle::bind(addr).await?);
        let (signal_tx, mut signal_rx) = mpsc::channel(64);
        handle.spawn_signal_receiver(signal_secret, signal_tx, logger.with_context("signal"));
        tokio::spawn(async move {
            while let Some(event) = signal_rx.recv().await {
                if events.send((signal_id, event)).await.is_err() {
                    return;
                }
            }
        });
    }

    Ok(())
}

fn socket_addr(addr: Option<&communicatord_core::address::ConnectionAddress>) -> Option<std::net::SocketAddr> {
    addr.and_then(|a| match &a.host {
        HostKind::Socket(socket) => Some(*socket),
        HostKind::UnixPath(_) => None,
    })
}

fn unix_path(addr: Option<&communicatord_core::address::ConnectionAddress>) -> Option<String> {
    addr.and_then(|a| match &a.host {
        HostKind::UnixPath(path) => Some(path.clone()),
        HostKind::Socket(_) => None,
    })
}

fn secure_listener(listeners: &ListenerConfig) -> Option<(std::net::SocketAddr, TlsMaterial)> {
    listeners.secure_listen.as_ref().and_then(|(addr, material)| match &addr.host {
        HostKind::Socket(socket) => Some((*socket, material.clone())),
        HostKind::UnixPath(_) => None,
    })
}

async fn spawn_tcp_acceptor(
    addr: std::net::SocketAddr,
    role: Role,
    incoming: mpsc::Sender<PendingConnection>,
    logger: Logger,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    logger.info(format!("listening on {addr}"));
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let pending = PendingConnection {
                        raw: RawStream::Tcp(stream),
                        peer_address: Some(peer),
                        direction: Direction::Inbound,
                        role,
                    };
                    if incoming.send(pending).await.is_err() {
                        return;
                    }
                }
                Err(err) => logger.warn(format!("accept failed on {addr}: {err}")),
            }
        }
    });
    Ok(())
}

async fn spawn_tls_acceptor(
    addr: std::net::SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    incoming: mpsc::Sender<PendingConnection>,
    logger: Logger,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    logger.info(format!("listening (tls) on {addr}"));
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => match tls::accept(&acceptor, stream).await {
                    Ok(tls_stream) => {
                        let (read_half, write_half) = tokio::io::split(tls_stream);
                        let pending = PendingConnection {
                            raw: RawStream::Boxed(Box::new(read_half), Box::new(write_half)),
                            peer_address: Some(peer),
                            direction: Direction::Inbound,
                            role: Role::InboundPeer,
                        };
                        if incoming.send(pending).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => logger.warn(format!("tls handshake with {peer} failed: {err}")),
                },
                Err(err) => logger.warn(format!("accept failed on {addr}: {err}")),
            }
        }
    });
    Ok(())
}

async fn spawn_unix_acceptor(
    path: String,
    incoming: mpsc::Sender<PendingConnection>,
    logger: Logger,
) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    logger.info(format!("listening on unix socket {path}"));
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let pending = PendingConnection {
                        raw: RawStream::Unix(stream),
                        peer_address: None,
                        direction: Direction::Inbound,
                        role: Role::LocalService,
                    };
                    if incoming.send(pending).await.is_err() {
                        return;
                    }
                }
                Err(err) => logger.warn(format!("accept failed on {path}: {err}")),
            }
        }
    });
    Ok(())
}
