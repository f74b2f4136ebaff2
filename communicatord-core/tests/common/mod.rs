//! Shared fixtures for the scenario tests in spec.md §8. Each fixture wires
//! a real loopback TCP pair into a `Broker` the same way `admit_pending`
//! does in production, then hands the test the raw client-side socket so
//! assertions read actual wire lines rather than internal state.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use communicatord_common::{Component, Logger};
use communicatord_core::config::{BrokerConfig, ListenerConfig};
use communicatord_core::registry::{Direction, Endpoint, EndpointId, Role, TransportKind};
use communicatord_core::transport::stream::{RawStream, StreamHandle};
use communicatord_core::transport::{ConnectionEvent, TransportOptions};
use communicatord_core::Broker;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub fn test_config(server_name: &str, data_path: PathBuf, locally_configured_services: &[&str]) -> BrokerConfig {
    BrokerConfig {
        server_name: server_name.to_string(),
        my_address: "127.0.0.1:4040".parse().unwrap(),
        listeners: ListenerConfig::default(),
        max_connections: 100,
        max_pending_connections: 10,
        neighbors: Vec::new(),
        signal_secret: None,
        data_path,
        debug_all_messages: false,
        locally_configured_services: locally_configured_services.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
    }
}

pub fn tempdir(label: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("communicatord-scenario-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn new_broker(server_name: &str, label: &str) -> Broker {
    new_broker_with_services(server_name, label, &[])
}

pub fn new_broker_with_services(server_name: &str, label: &str, services: &[&str]) -> Broker {
    let logger = Logger::new_root(Component::Broker, server_name.to_string());
    Broker::new(test_config(server_name, tempdir(label), services), logger).unwrap()
}

/// Accept one loopback connection into `broker`, spawning its stream tasks
/// against the shared `events` sender, and hand back the client side so the
/// test can write/read raw wire lines directly.
pub async fn admit_client(
    broker: &mut Broker,
    events: &mpsc::Sender<(EndpointId, ConnectionEvent)>,
    role: Role,
) -> (EndpointId, BufReader<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let client = TcpStream::connect(addr).await.unwrap();
    let server_side = accepted.await.unwrap();

    let mut endpoint = Endpoint::new(TransportKind::Stream, Direction::Inbound, role);
    endpoint.peer_address = Some(addr);
    let id = broker.register_endpoint(endpoint);

    let logger = Logger::new_root(Component::Transport, format!("{id:?}"));
    let handle = StreamHandle::spawn(
        id,
        RawStream::Tcp(server_side),
        events.clone(),
        TransportOptions::default(),
        logger,
    );
    broker.attach_stream(id, handle);

    (id, BufReader::new(client))
}

pub async fn send_line(client: &mut BufReader<TcpStream>, line: &str) {
    client.get_mut().write_all(format!("{line}\n").as_bytes()).await.unwrap();
}

/// Read and parse the next wire line from a client socket, failing the test
/// if nothing arrives within a generous bound (the broker path under test
/// never legitimately blocks).
pub async fn recv_message(client: &mut BufReader<TcpStream>) -> communicatord_core::message::Message {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_line(&mut line))
        .await
        .expect("timed out waiting for a reply")
        .unwrap();
    communicatord_core::message::Message::parse(&line).expect("reply was not a valid wire line")
}

/// True if a line arrives within `within` — used to assert silence (spec.md
/// §8 S3's "no delivery yet").
pub async fn no_message_within(client: &mut BufReader<TcpStream>, within: Duration) -> bool {
    let mut line = String::new();
    tokio::time::timeout(within, client.read_line(&mut line)).await.is_err()
}

/// Drain and apply exactly one event off the shared channel, matching the
/// broker's own `run` loop (`Broker::handle_event`) but driven synchronously
/// so tests can interleave assertions between steps.
pub async fn pump_one(
    broker: &mut Broker,
    events: &mut mpsc::Receiver<(EndpointId, ConnectionEvent)>,
) {
    let (id, event) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed");
    broker.handle_event(id, event);
}

pub fn shared_channel() -> (mpsc::Sender<(EndpointId, ConnectionEvent)>, mpsc::Receiver<(EndpointId, ConnectionEvent)>) {
    mpsc::channel(64)
}

#[allow(dead_code)]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
