//! The broker itself (spec.md §1, §4): owns the registry, cache, neighbor
//! store and dispatcher, and is the single point that ties routing,
//! broadcast, cluster membership and shutdown logic together.
//!
//! Runs single-threaded and cooperatively scheduled (spec.md §5): every
//! method here either takes `&mut self` directly or is reached through the
//! event loop in [`run`], so no locking is needed around the registry,
//! cache, or neighbor store.

pub mod broadcast;
pub mod cluster;
pub mod handlers;
pub mod routing;
pub mod shutdown;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use communicatord_common::logging::Logger;
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::config::BrokerConfig;
use crate::dispatcher::{Dispatcher, HandlerContext, Outcome};
use crate::message::{commands, Message};
use crate::neighbor_store::NeighborStore;
use crate::registry::{ConnectionType, Endpoint, EndpointId, Registry};
use crate::transport::backoff::BackoffSchedule;
use crate::transport::{ConnectionEvent, FailureTracker, PendingConnection};
use crate::transport::stream::StreamHandle;

use broadcast::SeenTable;
use cluster::ClusterState;

/// Backoff cursor and dial bookkeeping for one neighbor address (spec.md
/// §4.7 startup/reconnect routine). Kept separate from `FailureTracker`,
/// which tracks the longer-window flag-raising counter rather than the
/// immediate retry delay.
struct ReconnectState {
    schedule: BackoffSchedule,
    next_attempt_at: Instant,
    in_flight: bool,
}

/// Everything the broker needs to run for a single node: the live
/// connection set, the undeliverable-message cache, the persisted
/// neighbor list, and the command dispatcher.
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) logger: Logger,
    pub(crate) registry: Registry,
    pub(crate) cache: Cache,
    pub(crate) neighbor_store: NeighborStore,
    dispatcher: Dispatcher,
    pub(crate) shutting_down: bool,
    pub(crate) broadcast_seen: SeenTable,
    pub(crate) cluster_state: ClusterState,
    pub(crate) failure_trackers: HashMap<SocketAddr, FailureTracker>,
    pub(crate) outgoing: HashMap<EndpointId, StreamHandle>,
    reconnect: HashMap<SocketAddr, ReconnectState>,
    signal_endpoint: Option<EndpointId>,
}

impl Broker {
    pub fn new(config: BrokerConfig, logger: Logger) -> std::io::Result<Self> {
        let mut neighbor_store = NeighborStore::load(
            config.neighbor_store_path(),
            logger.with_context("neighbor-store"),
        )?;
        for addr in &config.neighbors {
            neighbor_store.add(*addr);
        }
        let cache = Cache::new(logger.with_context("cache"));
        let cluster_state = ClusterState::derive(neighbor_store.len(), 0);
        let mut registry = Registry::new();
        let signal_endpoint = config.listeners.signal_listen.is_some().then(|| {
            registry.insert(Endpoint::new(
                crate::registry::TransportKind::Datagram,
                crate::registry::Direction::Listener,
                crate::registry::Role::Signal,
            ))
        });
        Ok(Self {
            config,
            logger,
            registry,
            cache,
            neighbor_store,
            dispatcher: handlers::build_dispatcher(),
            shutting_down: false,
            broadcast_seen: SeenTable::new(),
            cluster_state,
            failure_trackers: HashMap::new(),
            outgoing: HashMap::new(),
            reconnect: HashMap::new(),
            signal_endpoint,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// The registry id reserved for the UDP signal listener (spec.md §6),
    /// if one was configured. The daemon binary uses this to tag datagram
    /// events before handing them to the shared event channel.
    pub fn signal_endpoint_id(&self) -> Option<EndpointId> {
        self.signal_endpoint
    }

    /// Register a newly-accepted or newly-dialed endpoint before its
    /// stream's reader/writer tasks are spawned. Callers need the returned
    /// id to tag events coming off those tasks (see [`Self::attach_stream`]).
    pub fn register_endpoint(&mut self, endpoint: Endpoint) -> EndpointId {
        self.registry.insert(endpoint)
    }

    /// Attach the stream handle for an endpoint registered via
    /// [`Self::register_endpoint`].
    pub fn attach_stream(&mut self, id: EndpointId, handle: StreamHandle) {
        self.outgoing.insert(id, handle);
    }

    /// Drop an endpoint from the registry and close its stream.
    pub fn evict(&mut self, id: EndpointId) {
        self.registry.remove(id);
        if let Some(handle) = self.outgoing.remove(&id) {
            handle.mark_done();
        }
        self.recompute_cluster_state();
    }

    /// Recompute cluster status and, when it changed, broadcast the new
    /// `CLUSTER_UP`/`CLUSTER_DOWN`/`CLUSTER_COMPLETE`/`CLUSTER_INCOMPLETE`
    /// command to every local service (spec.md §4.7: "broadcast to local
    /// services whenever the computed state changes").
    fn recompute_cluster_state(&mut self) {
        let previous = self.cluster_state.status_command();
        self.cluster_state =
            ClusterState::derive(self.neighbor_store.len(), self.registry.live_remote_count());
        let current = self.cluster_state.status_command();
        if current != previous {
            self.broadcast_to_local_services(&Message::new(current));
        }
    }

    /// Queue `message` for delivery to `id`, silently dropping it if the
    /// endpoint is no longer live (it may have hung up moments earlier).
    /// Non-blocking (spec.md §5): the event loop never waits on a peer.
    pub fn send_to(&self, id: EndpointId, message: &Message) {
        if let Some(handle) = self.outgoing.get(&id) {
            if handle.send_message(message).is_err() {
                self.logger.debug(format!("send to {id:?} failed: peer gone"));
            }
        }
    }

    /// Send `message` to every live local-service endpoint (the `NOTIFY`
    /// audience used by `NEWREMOTECONNECTION`/`DISCONNECTED`/`HANGUP`/
    /// `STATUS`/`CLUSTER_*`, spec.md §4.5/§4.7/§4.9).
    pub(crate) fn broadcast_to_local_services(&self, message: &Message) {
        for (id, _) in self.registry.local_service_endpoints().collect::<Vec<_>>() {
            self.send_to(id, message);
        }
    }

    /// Entry point for one inbound event off the shared connection-event
    /// channel. `id` identifies the originating endpoint.
    pub fn handle_event(&mut self, id: EndpointId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => {
                self.handle_message(id, message);
            }
            ConnectionEvent::Invalid(err) => {
                self.logger.warn(format!("dropping malformed message from {id:?}: {err}"));
            }
            ConnectionEvent::Hangup | ConnectionEvent::Error(_) => {
                // Unexpected loss of an established peer (spec.md §4.9):
                // tell local services before the link disappears from the
                // registry.
                let server_name = self.registry.get(id).and_then(|ep| {
                    (ep.connection_type == ConnectionType::Remote)
                        .then(|| ep.server_name.clone())
                        .flatten()
                });
                if let Some(name) = server_name {
                    self.broadcast_to_local_services(
                        &Message::new(commands::HANGUP).with_parameter("server-name", name),
                    );
                }
                self.evict(id);
            }
            ConnectionEvent::Connected => {}
            ConnectionEvent::ConnectionFailed(reason) => {
                self.logger.warn(format!("connection attempt failed: {reason}"));
            }
        }
    }

    /// Dispatch one parsed message: broker-addressed commands go through
    /// the [`Dispatcher`]; everything else is routed per spec.md §4.6.
    pub fn handle_message(&mut self, origin: EndpointId, message: Message) -> Outcome {
        if self.dispatcher.is_known_command(&message.command) {
            let dispatcher = std::mem::replace(&mut self.dispatcher, Dispatcher::new());
            let outcome = dispatcher
                .dispatch(self, origin, message)
                .unwrap_or(Outcome::Dropped);
            self.dispatcher = dispatcher;
            return outcome;
        }

        self.route_and_deliver(origin, message)
    }

    /// Apply a routing decision for a non-broadcast, non-broker-addressed
    /// message (spec.md §4.6).
    fn route_and_deliver(&mut self, origin: EndpointId, mut message: Message) -> Outcome {
        use crate::message::DestinationService;

        if message.destination_service.is_broadcast() {
            return self.deliver_broadcast(origin, message);
        }

        message.stamp_origin_if_empty(
            &self.config.server_name,
            self.registry
                .get(origin)
                .and_then(|ep| ep.service_name.as_deref())
                .unwrap_or(""),
        );

        let decision = routing::decide(
            &message,
            &self.registry,
            &self.config.server_name,
            &self.config.locally_configured_services,
        );

        match decision {
            routing::RoutingDecision::DeliverLocal(target) => {
                self.send_to(target, &message);
                Outcome::Delivered
            }
            routing::RoutingDecision::Cache => {
                let service = match &message.destination_service {
                    DestinationService::Named(name) => name.clone(),
                    _ => return Outcome::Dropped,
                };
                match self.cache.cache_message(&service, message, Instant::now()) {
                    crate::cache::CacheOutcome::Cached => Outcome::Cached,
                    crate::cache::CacheOutcome::Reply => {
                        // Undeliverable-with-reply: tell the originator via
                        // a TRANSMISSION_REPORT rather than silent loss.
                        self.send_to(
                            origin,
                            &Message::new(commands::TRANSMISSION_REPORT)
                                .with_parameter("status", "failed"),
                        );
                        Outcome::Dropped
                    }
                    crate::cache::CacheOutcome::Ignore => Outcome::Dropped,
                }
            }
            routing::RoutingDecision::ForwardTo(target) => {
                self.send_to(target, &message);
                Outcome::Delivered
            }
            routing::RoutingDecision::FloodAllRemotes => {
                for (id, _) in self.registry.remote_endpoints().collect::<Vec<_>>() {
                    self.send_to(id, &message);
                }
                Outcome::Delivered
            }
            routing::RoutingDecision::DropUnknownService | routing::RoutingDecision::InvalidDropped => {
                Outcome::Dropped
            }
        }
    }

    fn deliver_broadcast(&mut self, origin: EndpointId, mut message: Message) -> Outcome {
        let envelope = match broadcast::read_envelope(&message) {
            Ok(envelope) => envelope,
            Err(_) => {
                message = broadcast::stamp_new_broadcast(message, &self.config.server_name);
                broadcast::read_envelope(&message).expect("just stamped")
            }
        };

        let now = Instant::now();
        if !self.broadcast_seen.observe(&envelope.msgid, now + envelope.timeout) {
            return Outcome::Dropped;
        }

        let plan = broadcast::plan(&message.destination_service, &self.registry, &self.config.server_name);
        let plan = broadcast::exclude_already_informed(plan, &self.registry, &message);

        if plan.deliver_local {
            for (id, _) in self.registry.local_service_endpoints().collect::<Vec<_>>() {
                if id != origin {
                    self.send_to(id, &message);
                }
            }
        }

        if !plan.forward_to.is_empty() {
            broadcast::increment_hops(&mut message);
            for id in &plan.forward_to {
                if let Some(name) = self.registry.get(*id).and_then(|ep| ep.server_name.clone()) {
                    broadcast::mark_informed(&mut message, &name);
                }
            }
            for id in plan.forward_to {
                self.send_to(id, &message);
            }
        }

        Outcome::Delivered
    }

    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.cache.sweep(now);
        self.broadcast_seen.sweep(now);
    }

    /// Admit a freshly accepted or dialed connection: register it in the
    /// registry and spawn its reader/writer tasks, tagging every event the
    /// reader produces with the new `EndpointId` so [`Self::handle_event`]
    /// can attribute it correctly.
    fn admit_pending(
        &mut self,
        pending: PendingConnection,
        events_tx: &mpsc::Sender<(EndpointId, ConnectionEvent)>,
    ) {
        let transport_kind = match &pending.raw {
            crate::transport::stream::RawStream::Tcp(_) => crate::registry::TransportKind::Stream,
            crate::transport::stream::RawStream::Unix(_) => crate::registry::TransportKind::Stream,
            crate::transport::stream::RawStream::Boxed(..) => crate::registry::TransportKind::Stream,
        };
        let role = pending.role;
        let mut endpoint = Endpoint::new(transport_kind, pending.direction, role);
        endpoint.peer_address = pending.peer_address;

        let id = self.register_endpoint(endpoint);
        let handle = StreamHandle::spawn(
            id,
            pending.raw,
            events_tx.clone(),
            crate::transport::TransportOptions::default(),
            self.logger.with_context("stream"),
        );
        self.attach_stream(id, handle);

        match role {
            crate::registry::Role::OutboundPeer => {
                // We initiated this link (spec.md §4.7 half-graph rule):
                // send CONNECT immediately rather than waiting for the peer.
                let heard_of = cluster::render_heard_of(self.neighbor_store.iter());
                self.send_to(
                    id,
                    &Message::new(commands::CONNECT)
                        .with_parameter("version", crate::message::PROTOCOL_VERSION.to_string())
                        .with_parameter("my_address", self.config.my_address.to_string())
                        .with_parameter("server_name", self.config.server_name.clone())
                        .with_parameter("neighbors", heard_of),
                );
            }
            crate::registry::Role::Gossip => {
                // Short-lived probe (spec.md §4.7): send one GOSSIP then
                // drain and close.
                let heard_of = cluster::render_heard_of(self.neighbor_store.iter());
                self.send_to(
                    id,
                    &Message::new(commands::GOSSIP)
                        .with_parameter("my_address", self.config.my_address.to_string())
                        .with_parameter("neighbors", heard_of),
                );
                if let Some(handle) = self.outgoing.get(&id) {
                    handle.mark_done();
                }
            }
            _ => {}
        }
    }

    /// Neighbor-discovery startup/periodic routine (spec.md §4.7): dial
    /// every known neighbor we are not already connected to or currently
    /// dialing, using the half-graph rule to decide between opening a
    /// permanent outbound connection and sending a one-shot gossip probe.
    pub fn schedule_reconnects(
        &mut self,
        incoming_tx: &mpsc::Sender<PendingConnection>,
        reconnect_tx: &mpsc::Sender<(SocketAddr, bool)>,
    ) {
        let my_address = self.config.my_address;
        let now = Instant::now();
        let targets: Vec<SocketAddr> = self
            .neighbor_store
            .iter()
            .copied()
            .filter(|addr| *addr != my_address)
            .filter(|addr| self.registry.remote_endpoint_for_address(*addr).is_none())
            .collect();

        for addr in targets {
            let state = self.reconnect.entry(addr).or_insert_with(|| ReconnectState {
                schedule: BackoffSchedule::default(),
                next_attempt_at: now,
                in_flight: false,
            });
            if state.in_flight || now < state.next_attempt_at {
                continue;
            }
            state.in_flight = true;

            if cluster::should_initiate_connection(my_address, addr) {
                spawn_permanent_dial(
                    addr,
                    incoming_tx.clone(),
                    reconnect_tx.clone(),
                    self.logger.with_context("reconnect"),
                );
            } else {
                spawn_gossip_probe(
                    addr,
                    incoming_tx.clone(),
                    reconnect_tx.clone(),
                    self.logger.with_context("gossip"),
                );
            }
        }
    }

    /// Apply the outcome of a dial spawned by [`Self::schedule_reconnects`]:
    /// clear its in-flight flag, advance or reset its backoff delay, and
    /// feed the per-peer failure tracker spec.md §4.9 uses to raise the
    /// stuck-link flag after repeated failures.
    fn handle_reconnect_result(&mut self, addr: SocketAddr, connected: bool) {
        let now = Instant::now();
        if let Some(state) = self.reconnect.get_mut(&addr) {
            state.in_flight = false;
            if connected {
                state.schedule.reset();
                state.next_attempt_at = now;
            } else {
                state.next_attempt_at = now + state.schedule.current_delay();
                state.schedule.record_failure();
            }
        }

        let tracker = self.failure_trackers.entry(addr).or_default();
        if connected {
            tracker.record_success();
        } else {
            tracker.record_failure(now);
            if tracker.should_raise_flag(now) {
                self.logger.warn(format!(
                    "{addr} has failed to connect {} times over the past hour",
                    FailureTracker::FAILURE_THRESHOLD
                ));
            }
        }
    }

    /// The broker's single-threaded event loop (spec.md §5): drain the
    /// shared connection-event channel and the channel of freshly accepted
    /// connections, periodically sweeping the cache and broadcast dedup
    /// table. Returns once shutdown has been requested and every endpoint
    /// has drained and disconnected.
    pub async fn run(
        mut self,
        events_tx: mpsc::Sender<(EndpointId, ConnectionEvent)>,
        mut events: mpsc::Receiver<(EndpointId, ConnectionEvent)>,
        incoming_tx: mpsc::Sender<PendingConnection>,
        mut incoming: mpsc::Receiver<PendingConnection>,
    ) {
        let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<(SocketAddr, bool)>(64);
        let mut sweep_interval = tokio::time::interval(Duration::from_secs(30));
        let mut reconnect_interval = tokio::time::interval(Duration::from_secs(10));

        // Startup routine (spec.md §4.7): open outbound links to every
        // known neighbor before waiting on the first event.
        self.schedule_reconnects(&incoming_tx, &reconnect_tx);

        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Some((id, event)) => self.handle_event(id, event),
                        None => break,
                    }
                    if self.shutting_down && self.registry.iter().next().is_none() {
                        break;
                    }
                }
                pending = incoming.recv() => {
                    match pending {
                        Some(pending) => self.admit_pending(pending, &events_tx),
                        None => {}
                    }
                }
                result = reconnect_rx.recv() => {
                    if let Some((addr, connected)) = result {
                        self.handle_reconnect_result(addr, connected);
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep();
                }
                _ = reconnect_interval.tick() => {
                    self.schedule_reconnects(&incoming_tx, &reconnect_tx);
                }
            }
        }
        self.logger.info("broker event loop exited");
    }
}

/// Dial `addr` once via a [`PermanentConnection`] attempt and hand the raw
/// stream to the broker's admission pipeline on success (spec.md §4.3,
/// §4.7). Runs as its own task since the broker's event loop never awaits
/// a peer directly.
fn spawn_permanent_dial(
    addr: SocketAddr,
    incoming: mpsc::Sender<PendingConnection>,
    result: mpsc::Sender<(SocketAddr, bool)>,
    logger: Logger,
) {
    tokio::spawn(async move {
        let mut conn = crate::transport::stream::PermanentConnection::new(addr, logger);
        let connected = match conn.attempt_once(Duration::from_secs(30)).await {
            Ok(stream) => {
                let pending = PendingConnection {
                    raw: crate::transport::stream::RawStream::Tcp(stream),
                    peer_address: Some(addr),
                    direction: crate::registry::Direction::Outbound,
                    role: crate::registry::Role::OutboundPeer,
                };
                incoming.send(pending).await.is_ok()
            }
            Err(_) => false,
        };
        let _ = result.send((addr, connected)).await;
    });
}

/// Open a short-lived connection to `addr` whose only purpose is to carry
/// one GOSSIP message (spec.md §4.7: the larger-address side of a pair
/// probes instead of holding a permanent connection open).
fn spawn_gossip_probe(
    addr: SocketAddr,
    incoming: mpsc::Sender<PendingConnection>,
    result: mpsc::Sender<(SocketAddr, bool)>,
    logger: Logger,
) {
    tokio::spawn(async move {
        let connected = match tokio::time::timeout(
            Duration::from_secs(10),
            tokio::net::TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => {
                let pending = PendingConnection {
                    raw: crate::transport::stream::RawStream::Tcp(stream),
                    peer_address: Some(addr),
                    direction: crate::registry::Direction::Outbound,
                    role: crate::registry::Role::Gossip,
                };
                incoming.send(pending).await.is_ok()
            }
            Ok(Err(err)) => {
                logger.debug(format!("gossip probe to {addr} failed: {err}"));
                false
            }
            Err(_) => {
                logger.debug(format!("gossip probe to {addr} timed out"));
                false
            }
        };
        let _ = result.send((addr, connected)).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ListenerConfig};
    use crate::registry::{Direction, Role, TransportKind};
    use crate::transport::stream::RawStream;
    use crate::transport::TransportOptions;
    use communicatord_common::{Component, Logger};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn test_config(data_path: PathBuf) -> BrokerConfig {
        BrokerConfig {
            server_name: "n1".to_string(),
            my_address: "127.0.0.1:4040".parse().unwrap(),
            listeners: ListenerConfig::default(),
            max_connections: 100,
            max_pending_connections: 10,
            neighbors: Vec::new(),
            signal_secret: None,
            data_path,
            debug_all_messages: false,
            locally_configured_services: HashSet::new(),
        }
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("communicatord-broker-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Connects a fresh socket pair, registers the server side as a
    /// REMOTE/InboundPeer endpoint with the given server name, and hands
    /// back the broker plus both the endpoint id and the client side of the
    /// socket so a test can drive `ConnectionEvent`s or read broadcasts.
    async fn remote_peer(broker: &mut Broker, server_name: &str) -> (EndpointId, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server = server_task.await.unwrap();

        let (events_tx, _events_rx) = mpsc::channel(16);
        let handle = StreamHandle::spawn(
            EndpointId::test_handle(),
            RawStream::Tcp(server),
            events_tx,
            TransportOptions::default(),
            Logger::new_root(Component::Broker, "test"),
        );
        let mut endpoint = Endpoint::new(TransportKind::Stream, Direction::Inbound, Role::InboundPeer);
        endpoint.peer_address = Some(addr);
        endpoint.connection_type = ConnectionType::Remote;
        endpoint.server_name = Some(server_name.to_string());
        let id = broker.register_endpoint(endpoint);
        broker.attach_stream(id, handle);
        (id, client)
    }

    async fn local_service(broker: &mut Broker) -> tokio::net::TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server = server_task.await.unwrap();

        let (events_tx, _events_rx) = mpsc::channel(16);
        let handle = StreamHandle::spawn(
            EndpointId::test_handle(),
            RawStream::Tcp(server),
            events_tx,
            TransportOptions::default(),
            Logger::new_root(Component::Broker, "test"),
        );
        let mut endpoint = Endpoint::new(TransportKind::Stream, Direction::Inbound, Role::LocalService);
        endpoint.connection_type = ConnectionType::Local;
        endpoint.service_name = Some("svc".to_string());
        let id = broker.register_endpoint(endpoint);
        broker.attach_stream(id, handle);
        client
    }

    async fn read_line(stream: &mut tokio::net::TcpStream) -> String {
        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        reader.read_line(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn unexpected_hangup_broadcasts_hangup_before_evicting() {
        let logger = Logger::new_root(Component::Broker, "test");
        let mut broker = Broker::new(test_config(tempdir()), logger).unwrap();
        let (peer_id, _peer_client) = remote_peer(&mut broker, "n2").await;
        let mut svc_stream = local_service(&mut broker).await;

        broker.handle_event(peer_id, ConnectionEvent::Hangup);

        let broadcast = read_line(&mut svc_stream).await;
        assert!(broadcast.contains(commands::HANGUP));
        assert!(broadcast.contains("server-name=n2"));
        assert!(broker.registry.get(peer_id).is_none());
    }

    #[tokio::test]
    async fn cluster_state_change_broadcasts_to_local_services() {
        let logger = Logger::new_root(Component::Broker, "test");
        let mut broker = Broker::new(test_config(tempdir()), logger).unwrap();
        broker.neighbor_store.add("10.0.0.2:4040".parse().unwrap());
        let mut svc_stream = local_service(&mut broker).await;

        // Going from zero known neighbors connected (DOWN) to one out of
        // one connected (UP and COMPLETE) must broadcast the new status.
        let (_peer_id, _peer_client) = remote_peer(&mut broker, "n2").await;
        broker.recompute_cluster_state();

        let broadcast = read_line(&mut svc_stream).await;
        assert!(broadcast.contains(commands::CLUSTER_COMPLETE));
    }

    #[tokio::test]
    async fn undeliverable_cache_reply_sends_transmission_report() {
        let logger = Logger::new_root(Component::Broker, "test");
        let mut broker = Broker::new(test_config(tempdir()), logger).unwrap();
        let (origin, mut origin_client) = remote_peer(&mut broker, "n2").await;

        let message = Message::new("PING")
            .with_destination(
                crate::message::DestinationServer::Unspecified,
                crate::message::DestinationService::Named("nobody".to_string()),
            )
            .with_parameter("cache", "no;reply");
        let outcome = broker.route_and_deliver(origin, message);
        assert_eq!(outcome, Outcome::Dropped);

        let reply = read_line(&mut origin_client).await;
        assert!(reply.contains(commands::TRANSMISSION_REPORT));
        assert!(reply.contains("status=failed"));
    }
}
