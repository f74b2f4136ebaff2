//! Per-command handler logic (spec.md §4.5), registered once into a
//! [`Dispatcher`] built at startup. Each handler is a thin closure
//! forwarding into [`Broker::handle_command`], which does the actual work
//! — keeping the dispatcher table itself free of broker internals, per
//! spec.md §9 DESIGN NOTES.

use std::time::Instant;

use crate::dispatcher::{Dispatcher, HandlerContext, Outcome};
use crate::message::{commands, Message};
use crate::registry::{ConnectionType, Direction, Endpoint, EndpointId, Role, TransportKind};

use super::cluster;
use super::shutdown::{self, RefuseReason, ShutdownScope};
use super::Broker;

/// Build the table of broker-addressed commands (spec.md §4.5). Every
/// registered command forwards to [`Broker::handle_command`]; commands not
/// in this table fall through to the routing path in
/// [`super::Broker::route_and_deliver`].
pub fn build_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    for command in [
        commands::REGISTER,
        commands::UNREGISTER,
        commands::CONNECT,
        commands::ACCEPT,
        commands::DISCONNECT,
        commands::REFUSE,
        commands::GOSSIP,
        commands::FORGET,
        commands::COMMANDS,
        commands::HELP,
        commands::CLUSTER_STATUS,
        commands::SHUTDOWN,
        commands::STOP,
        commands::SERVICE_STATUS,
        commands::UNKNOWN,
    ] {
        dispatcher.register(
            command,
            Box::new(move |ctx, origin, message| ctx.handle_command(command, origin, message)),
        );
    }
    dispatcher
}

impl HandlerContext for Broker {
    fn handle_command(&mut self, command: &str, origin: EndpointId, message: Message) -> Outcome {
        match command {
            commands::REGISTER => self.handle_register(origin, message),
            commands::UNREGISTER => self.handle_unregister(origin, message),
            commands::CONNECT => self.handle_connect(origin, message),
            commands::ACCEPT => self.handle_accept(origin, message),
            commands::DISCONNECT => self.handle_disconnect(origin, message),
            commands::REFUSE => self.handle_refuse(origin, message),
            commands::GOSSIP => self.handle_gossip(origin, message),
            commands::FORGET => self.handle_forget(origin, message),
            commands::COMMANDS => self.handle_commands_query(origin, message),
            commands::HELP => self.handle_help(origin, message),
            commands::CLUSTER_STATUS => self.handle_cluster_status(origin, message),
            commands::SHUTDOWN | commands::STOP => self.handle_shutdown(command, origin, message),
            commands::SERVICE_STATUS => self.handle_service_status(origin, message),
            commands::UNKNOWN => {
                self.logger.debug(format!("peer reports UNKNOWN for a command we sent: {message}"));
                Outcome::Dropped
            }
            other => {
                self.logger.warn(format!("dispatcher registered for unhandled command {other}"));
                Outcome::Dropped
            }
        }
    }
}

impl Broker {
    /// `REGISTER{service=<name>[,commands=<comma-list>]}` (spec.md §4.5):
    /// claims `origin` as the local-service endpoint for `service`, replies
    /// `READY`, and drains any cached messages addressed to that service.
    fn handle_register(&mut self, origin: EndpointId, message: Message) -> Outcome {
        let Some(service) = message.parameter("service").map(str::to_string) else {
            self.send_to(origin, &Message::new(commands::REFUSE));
            return Outcome::Refused;
        };

        if let Some(existing) = self.registry.find_local_service("", &service) {
            if existing != origin {
                self.send_to(
                    origin,
                    &Message::new(commands::REFUSE).with_parameter("conflict", service.clone()),
                );
                return Outcome::Refused;
            }
        }

        let server_name = self.config.server_name.clone();
        if let Some(endpoint) = self.registry.get_mut(origin) {
            endpoint.role = Role::LocalService;
            endpoint.connection_type = ConnectionType::Local;
            endpoint.service_name = Some(service.clone());
            endpoint.server_name = Some(server_name);
            if let Some(raw) = message.parameter("commands") {
                endpoint.commands_understood =
                    raw.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
            }
        }

        self.send_to(origin, &Message::new(commands::READY));

        let now = Instant::now();
        let mut drained = Vec::new();
        self.cache.drain_into(&service, now, |msg| drained.push(msg));
        for msg in drained {
            self.send_to(origin, &msg);
        }

        Outcome::Delivered
    }

    /// `UNREGISTER` (spec.md §4.5): the service is shutting down cleanly;
    /// acknowledge, broadcast its new `down` status to local services, then
    /// evict the endpoint.
    fn handle_unregister(&mut self, origin: EndpointId, _message: Message) -> Outcome {
        let service_name = self.registry.get(origin).and_then(|ep| ep.service_name.clone());
        self.send_to(origin, &Message::new(commands::DISCONNECTED));
        if let Some(service) = service_name {
            self.broadcast_to_local_services(
                &Message::new(commands::STATUS)
                    .with_parameter("service", service)
                    .with_parameter("status", "down"),
            );
        }
        self.evict(origin);
        Outcome::Delivered
    }

    /// `CONNECT{version, server_name=<name>[,neighbors=<list>]}` (spec.md
    /// §4.5/§4.7/§6): a peer broker is establishing (or re-establishing)
    /// the inter-node link. Checked in the same order as a name conflict
    /// would make the others moot: protocol version, shutdown, connection
    /// limit, then name conflict; on success, merges the peer's neighbor
    /// set, replies `ACCEPT` and `HELP`, and broadcasts
    /// `NEWREMOTECONNECTION` to local services.
    fn handle_connect(&mut self, origin: EndpointId, message: Message) -> Outcome {
        let Some(version) = message.parameter("version").and_then(|v| v.parse::<u32>().ok()) else {
            self.logger.warn("CONNECT missing or malformed version parameter, dropping");
            return Outcome::Dropped;
        };
        if version != crate::message::PROTOCOL_VERSION {
            self.logger.warn(format!(
                "CONNECT rejected: incompatible version (expected {}, got {version})",
                crate::message::PROTOCOL_VERSION
            ));
            return Outcome::Dropped;
        }

        let server_name = message.parameter("server_name").map(str::to_string);

        if let Some(name) = &server_name {
            if let Some(existing) = self.registry.find_remote_by_server_name(name) {
                if existing != origin {
                    self.send_to(
                        origin,
                        &Message::new(commands::REFUSE).with_parameter("conflict", name.clone()),
                    );
                    return Outcome::Refused;
                }
            }
        }

        if self.shutting_down {
            self.send_to(
                origin,
                &Message::new(commands::REFUSE).with_parameter("shutdown", "true"),
            );
            return Outcome::Refused;
        }

        if self.registry.live_remote_count() >= self.config.max_connections {
            self.send_to(origin, &Message::new(commands::REFUSE));
            return Outcome::Refused;
        }

        if let Some(endpoint) = self.registry.get_mut(origin) {
            endpoint.direction = Direction::Inbound;
            endpoint.role = Role::InboundPeer;
            endpoint.connection_type = ConnectionType::Remote;
            endpoint.server_name = server_name.clone();
        }

        self.merge_heard_of(&message);

        let heard_of = cluster::render_heard_of(self.neighbor_store.iter());
        self.send_to(
            origin,
            &Message::new(commands::ACCEPT)
                .with_parameter("server_name", self.config.server_name.clone())
                .with_parameter("neighbors", heard_of),
        );
        self.send_to(origin, &Message::new(commands::HELP));

        if let Some(name) = server_name {
            self.broadcast_to_local_services(
                &Message::new(commands::NEWREMOTECONNECTION).with_parameter("server-name", name),
            );
        }

        self.recompute_cluster_state();
        self.persist_cluster_status();
        Outcome::Delivered
    }

    /// `ACCEPT{server_name=<name>[,neighbors=<list>]}` (spec.md §4.7): the
    /// peer we dialed completed the handshake.
    fn handle_accept(&mut self, origin: EndpointId, message: Message) -> Outcome {
        let server_name = message.parameter("server_name").map(str::to_string);
        if let Some(endpoint) = self.registry.get_mut(origin) {
            endpoint.direction = Direction::Outbound;
            endpoint.role = Role::OutboundPeer;
            endpoint.connection_type = ConnectionType::Remote;
            endpoint.server_name = server_name;
        }

        self.merge_heard_of(&message);
        self.recompute_cluster_state();
        self.persist_cluster_status();
        Outcome::Delivered
    }

    fn merge_heard_of(&mut self, message: &Message) {
        if let Some(raw) = message.parameter("neighbors") {
            let addrs = cluster::parse_heard_of(raw);
            let added = self.neighbor_store.merge(addrs);
            if !added.is_empty() {
                self.logger.info(format!("learned {} new neighbor(s) via handshake", added.len()));
            }
        }
    }

    fn persist_cluster_status(&self) {
        let connected = self
            .registry
            .remote_endpoints()
            .filter_map(|(_, ep)| ep.peer_address)
            .collect();
        if let Err(err) =
            cluster::persist_cluster_status(&self.config.cluster_status_path(), self.cluster_state, &connected)
        {
            self.logger.error(format!("failed to persist cluster status: {err}"));
        }
    }

    /// `DISCONNECT` (spec.md §4.5): a peer is closing this link
    /// deliberately (not a failure). Acknowledge, broadcast `DISCONNECTED`
    /// to local services if the endpoint had a known server name, then
    /// evict.
    fn handle_disconnect(&mut self, origin: EndpointId, _message: Message) -> Outcome {
        let (is_remote, server_name) = self
            .registry
            .get(origin)
            .map(|ep| (ep.connection_type == ConnectionType::Remote, ep.server_name.clone()))
            .unwrap_or((false, None));
        self.send_to(origin, &shutdown::farewell_for(is_remote));
        if let Some(name) = server_name {
            self.broadcast_to_local_services(
                &Message::new(commands::DISCONNECTED).with_parameter("server-name", name),
            );
        }
        self.evict(origin);
        Outcome::Delivered
    }

    /// `REFUSE` (spec.md §4.9): the peer rejected our CONNECT/REGISTER.
    /// Classify why and drop the connection; reconnection backoff is owned
    /// by the transport layer's `PermanentConnection`, which the caller
    /// updates using this classification.
    fn handle_refuse(&mut self, origin: EndpointId, message: Message) -> Outcome {
        match shutdown::classify_refuse(&message) {
            RefuseReason::Conflict(name) => {
                self.logger.warn(format!("connection refused: name conflict with {name}"));
            }
            RefuseReason::Shutdown => {
                self.logger.info("connection refused: peer is shutting down");
            }
            RefuseReason::TooBusy => {
                self.logger.warn("connection refused: peer is too busy");
            }
            RefuseReason::Transient => {
                self.logger.debug("connection refused");
            }
        }
        self.evict(origin);
        Outcome::Refused
    }

    /// `GOSSIP{neighbors=<list>}` (spec.md §4.7): best-effort neighbor
    /// address exchange, no reply expected.
    fn handle_gossip(&mut self, _origin: EndpointId, message: Message) -> Outcome {
        self.merge_heard_of(&message);
        self.recompute_cluster_state();
        Outcome::Delivered
    }

    /// `FORGET{address=<ip:port>}` (spec.md §4.5): administratively drop a
    /// neighbor from the persisted set (it will not be reconnected to).
    fn handle_forget(&mut self, _origin: EndpointId, message: Message) -> Outcome {
        let Some(addr) = message.parameter("address").and_then(|raw| raw.parse().ok()) else {
            return Outcome::Dropped;
        };
        self.neighbor_store.forget(&addr);
        Outcome::Delivered
    }

    /// `COMMANDS`/`HELP` (spec.md §4.5): report the set of commands this
    /// broker (or the requesting endpoint's own registered service)
    /// understands.
    fn handle_commands_query(&mut self, origin: EndpointId, _message: Message) -> Outcome {
        self.reply_commands(origin)
    }

    fn handle_help(&mut self, origin: EndpointId, _message: Message) -> Outcome {
        self.reply_commands(origin)
    }

    fn reply_commands(&mut self, origin: EndpointId) -> Outcome {
        let list = [
            commands::REGISTER,
            commands::UNREGISTER,
            commands::CONNECT,
            commands::ACCEPT,
            commands::DISCONNECT,
            commands::REFUSE,
            commands::GOSSIP,
            commands::FORGET,
            commands::COMMANDS,
            commands::HELP,
            commands::CLUSTER_STATUS,
            commands::SHUTDOWN,
            commands::STOP,
            commands::SERVICE_STATUS,
        ]
        .join(",");
        self.send_to(origin, &Message::new(commands::COMMANDS).with_parameter("list", list));
        Outcome::Delivered
    }

    /// `CLUSTER_STATUS` (spec.md §4.7): report UP/DOWN/COMPLETE/INCOMPLETE.
    fn handle_cluster_status(&mut self, origin: EndpointId, _message: Message) -> Outcome {
        self.send_to(origin, &Message::new(self.cluster_state.status_command()));
        Outcome::Delivered
    }

    /// `STOP`/`SHUTDOWN` (spec.md §4.9): begin graceful shutdown. `STOP`
    /// only affects this broker; `SHUTDOWN` additionally forwards the
    /// request to every connected peer.
    fn handle_shutdown(&mut self, command: &str, origin: EndpointId, _message: Message) -> Outcome {
        let Some(scope) = shutdown::shutdown_scope(command) else {
            return Outcome::Dropped;
        };
        self.shutting_down = true;

        let targets: Vec<EndpointId> = self.registry.iter().map(|(id, _)| id).collect();
        for id in targets {
            let is_remote = self
                .registry
                .get(id)
                .map(|ep| ep.connection_type == ConnectionType::Remote)
                .unwrap_or(false);
            self.send_to(id, &shutdown::farewell_for(is_remote));
            if scope == ShutdownScope::Cluster && is_remote {
                self.send_to(id, &Message::new(commands::SHUTDOWN));
            }
        }

        self.logger.info(format!("shutdown requested by {origin:?}, scope {scope:?}"));
        Outcome::Delivered
    }

    /// `SERVICE_STATUS{service=<name>}` (spec.md §4.5): report whether a
    /// named service is currently registered locally.
    fn handle_service_status(&mut self, origin: EndpointId, message: Message) -> Outcome {
        let Some(service) = message.parameter("service") else {
            return Outcome::Dropped;
        };
        let status = if self.registry.find_local_service("", service).is_some() {
            "registered"
        } else {
            "unregistered"
        };
        self.send_to(
            origin,
            &Message::new(commands::SERVICE_STATUS)
                .with_parameter("service", service)
                .with_parameter("status", status),
        );
        Outcome::Delivered
    }
}
