//! Connection registry: the live set of endpoints (spec.md §3, §4.5).
//!
//! Per the DESIGN NOTES in spec.md §9, endpoints live in a slab owned by the
//! registry and are referenced by stable `EndpointId` handles (index +
//! generation) rather than by shared-ownership back-pointers. This removes
//! any weak-back-pointer cycle between the broker and its connections.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

/// Stable handle into the registry's slab. Stale handles (endpoint removed,
/// generation bumped) are detected and rejected by `get`/`get_mut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    index: usize,
    generation: u64,
}

impl EndpointId {
    #[cfg(test)]
    pub fn test_handle() -> Self {
        Self {
            index: 0,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Listener,
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    LocalService,
    InboundPeer,
    OutboundPeer,
    Gossip,
    Signal,
}

/// `DOWN` / `LOCAL` / `REMOTE` per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Down,
    Local,
    Remote,
}

impl Role {
    /// Invariant (spec.md §3): role and connection-type must be consistent.
    pub fn expected_connection_type(&self) -> ConnectionType {
        match self {
            Role::LocalService => ConnectionType::Local,
            Role::InboundPeer | Role::OutboundPeer | Role::Gossip => ConnectionType::Remote,
            // Listeners and the signal receiver carry no peer session state;
            // they start and stay DOWN from the registry's point of view
            // until a session is accepted off of them.
            Role::Signal => ConnectionType::Down,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// An entry in the connection registry.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub transport_kind: TransportKind,
    pub direction: Direction,
    pub role: Role,
    pub peer_address: Option<SocketAddr>,
    pub server_name: Option<String>,
    pub service_name: Option<String>,
    pub commands_understood: HashSet<String>,
    pub connection_type: ConnectionType,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub credentials: Option<Credentials>,
    pub wants_loadavg: bool,
}

impl Endpoint {
    pub fn new(transport_kind: TransportKind, direction: Direction, role: Role) -> Self {
        Self {
            transport_kind,
            direction,
            role,
            peer_address: None,
            server_name: None,
            service_name: None,
            commands_understood: HashSet::new(),
            connection_type: ConnectionType::Down,
            started_at: Instant::now(),
            ended_at: None,
            credentials: None,
            wants_loadavg: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.ended_at.is_none() && self.connection_type != ConnectionType::Down
    }

    pub fn understands(&self, command: &str) -> bool {
        self.commands_understood.iter().any(|c| c == command)
    }
}

enum Slot {
    Occupied(Endpoint, u64),
    Vacant(u64),
}

/// The authoritative set of live endpoints (spec.md §4.5).
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free_list: Vec<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    pub fn insert(&mut self, endpoint: Endpoint) -> EndpointId {
        if let Some(index) = self.free_list.pop() {
            let generation = match self.slots[index] {
                Slot::Vacant(generation) => generation,
                Slot::Occupied(..) => unreachable!("free list points at occupied slot"),
            };
            self.slots[index] = Slot::Occupied(endpoint, generation);
            EndpointId { index, generation }
        } else {
            let index = self.slots.len();
            let generation = 0;
            self.slots.push(Slot::Occupied(endpoint, generation));
            EndpointId { index, generation }
        }
    }

    pub fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        match self.slots.get(id.index) {
            Some(Slot::Occupied(_, generation)) if *generation == id.generation => {
                let next_generation = generation.wrapping_add(1);
                let Slot::Occupied(endpoint, _) =
                    std::mem::replace(&mut self.slots[id.index], Slot::Vacant(next_generation))
                else {
                    unreachable!()
                };
                self.free_list.push(id.index);
                Some(endpoint)
            }
            _ => None,
        }
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        match self.slots.get(id.index) {
            Some(Slot::Occupied(endpoint, generation)) if *generation == id.generation => {
                Some(endpoint)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        match self.slots.get_mut(id.index) {
            Some(Slot::Occupied(endpoint, generation)) if *generation == id.generation => {
                Some(endpoint)
            }
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EndpointId, &Endpoint)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied(endpoint, generation) => Some((
                EndpointId {
                    index,
                    generation: *generation,
                },
                endpoint,
            )),
            Slot::Vacant(_) => None,
        })
    }

    /// The first live local-service endpoint whose service name equals
    /// `service`, optionally filtered by `server` (empty/`*` matches any
    /// server, per the routing step in spec.md §4.6 step 2).
    pub fn find_local_service(&self, server: &str, service: &str) -> Option<EndpointId> {
        self.iter()
            .find(|(_, ep)| {
                ep.role == Role::LocalService
                    && ep.is_live()
                    && ep.service_name.as_deref() == Some(service)
                    && (server.is_empty() || server == "*" || ep.server_name.as_deref() == Some(server))
            })
            .map(|(id, _)| id)
    }

    /// The live REMOTE endpoint for a given server name, enforcing the
    /// at-most-one-per-server-name invariant (spec.md §3).
    pub fn find_remote_by_server_name(&self, server_name: &str) -> Option<EndpointId> {
        self.iter()
            .find(|(_, ep)| {
                ep.connection_type == ConnectionType::Remote
                    && ep.is_live()
                    && ep.server_name.as_deref() == Some(server_name)
            })
            .map(|(id, _)| id)
    }

    /// All live REMOTE endpoints whose claimed command vocabulary contains
    /// `service` as a registered service (spec.md §4.6 step 4). Claimed
    /// services are tracked via `Endpoint::service_name` on the remote's
    /// own registration mirror, or via a server-level `services` set that
    /// the CONNECT/ACCEPT handshake populates (see `broker::cluster`).
    pub fn remote_endpoints(&self) -> impl Iterator<Item = (EndpointId, &Endpoint)> {
        self.iter()
            .filter(|(_, ep)| ep.connection_type == ConnectionType::Remote && ep.is_live())
    }

    pub fn local_service_endpoints(&self) -> impl Iterator<Item = (EndpointId, &Endpoint)> {
        self.iter()
            .filter(|(_, ep)| ep.role == Role::LocalService && ep.is_live())
    }

    pub fn live_remote_count(&self) -> usize {
        self.remote_endpoints().count()
    }

    /// The live REMOTE endpoint dialing or dialed from `addr`, if any
    /// (spec.md §4.7 neighbor discovery: used to avoid opening a second
    /// link to a peer we are already connected to).
    pub fn remote_endpoint_for_address(&self, addr: SocketAddr) -> Option<EndpointId> {
        self.remote_endpoints()
            .find(|(_, ep)| ep.peer_address == Some(addr))
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_endpoint(server_name: &str) -> Endpoint {
        let mut ep = Endpoint::new(TransportKind::Stream, Direction::Outbound, Role::OutboundPeer);
        ep.server_name = Some(server_name.to_string());
        ep.connection_type = ConnectionType::Remote;
        ep
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut registry = Registry::new();
        let id = registry.insert(remote_endpoint("n2"));
        assert!(registry.get(id).is_some());
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.server_name.as_deref(), Some("n2"));
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut registry = Registry::new();
        let id1 = registry.insert(remote_endpoint("n2"));
        registry.remove(id1).unwrap();
        let id2 = registry.insert(remote_endpoint("n3"));
        assert_eq!(id1.index, id2.index);
        assert!(registry.get(id1).is_none());
        assert!(registry.get(id2).is_some());
    }

    #[test]
    fn find_remote_by_server_name_enforces_single_live_endpoint() {
        let mut registry = Registry::new();
        registry.insert(remote_endpoint("n2"));
        assert!(registry.find_remote_by_server_name("n2").is_some());
        assert!(registry.find_remote_by_server_name("n3").is_none());
    }

    #[test]
    fn find_local_service_matches_by_name() {
        let mut registry = Registry::new();
        let mut ep = Endpoint::new(TransportKind::Stream, Direction::Inbound, Role::LocalService);
        ep.service_name = Some("alpha".to_string());
        ep.server_name = Some("n1".to_string());
        ep.connection_type = ConnectionType::Local;
        registry.insert(ep);

        assert!(registry.find_local_service("", "alpha").is_some());
        assert!(registry.find_local_service("n1", "alpha").is_some());
        assert!(registry.find_local_service("n2", "alpha").is_none());
        assert!(registry.find_local_service("", "beta").is_none());
    }
}
