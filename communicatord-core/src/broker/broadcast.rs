//! Broadcast fan-out (spec.md §4.8): `*`/`?`/`.` destination-service values,
//! the broadcast envelope parameters, hop-count capping, and the
//! seen-message dedup table that keeps a flooded broadcast from looping
//! forever on a cluster with cycles in its connection graph.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::message::{params, DestinationService, Message};
use crate::registry::{EndpointId, Registry};

pub const MAX_HOPS: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the broker should do with a broadcast-destined message, decomposed
/// by audience so the caller can reuse its normal local-delivery and
/// remote-forwarding paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    pub deliver_local: bool,
    pub forward_to: Vec<EndpointId>,
}

/// Tracks in-flight broadcast message IDs to stop a message being processed
/// twice (spec.md §4.8 "a node that has already seen a broadcast-msgid
/// drops it silently, having already informed its neighbors"). Entries
/// expire after their broadcast's own timeout so the table cannot grow
/// without bound.
#[derive(Default)]
pub struct SeenTable {
    seen: HashMap<String, Instant>,
}

impl SeenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `msgid` as seen until `expires_at`. Returns `true` if this is
    /// the first time the id has been observed (and therefore the message
    /// should still be processed).
    pub fn observe(&mut self, msgid: &str, expires_at: Instant) -> bool {
        if self.seen.contains_key(msgid) {
            return false;
        }
        self.seen.insert(msgid.to_string(), expires_at);
        true
    }

    pub fn sweep(&mut self, now: Instant) {
        self.seen.retain(|_, expiry| *expiry > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Stamp a fresh broadcast envelope onto `message`, per spec.md §4.8: a
/// generated `broadcast-msgid`, `broadcast-hops=0`, the configured timeout
/// (or the default), and `broadcast-originator` set to this node.
pub fn stamp_new_broadcast(mut message: Message, this_server_name: &str) -> Message {
    if !message.has_parameter(params::BROADCAST_MSGID) {
        message.set_parameter(params::BROADCAST_MSGID, Uuid::new_v4().to_string());
    }
    if !message.has_parameter(params::BROADCAST_HOPS) {
        message.set_parameter(params::BROADCAST_HOPS, "0");
    }
    if !message.has_parameter(params::BROADCAST_TIMEOUT) {
        message.set_parameter(params::BROADCAST_TIMEOUT, DEFAULT_TIMEOUT.as_secs().to_string());
    }
    if !message.has_parameter(params::BROADCAST_ORIGINATOR) {
        message.set_parameter(params::BROADCAST_ORIGINATOR, this_server_name);
    }
    message
}

/// Parsed broadcast envelope fields, with the spec's defaults already
/// applied.
pub struct Envelope {
    pub msgid: String,
    pub hops: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    MissingMsgid,
    HopsExceeded,
}

/// Read the broadcast envelope off `message`, rejecting it once
/// `broadcast-hops` has reached [`MAX_HOPS`] (spec.md §4.8 "a message that
/// has made more than 5 hops is dropped rather than forwarded further").
pub fn read_envelope(message: &Message) -> Result<Envelope, EnvelopeError> {
    let msgid = message
        .parameter(params::BROADCAST_MSGID)
        .ok_or(EnvelopeError::MissingMsgid)?
        .to_string();
    let hops: u32 = message
        .parameter(params::BROADCAST_HOPS)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if hops > MAX_HOPS {
        return Err(EnvelopeError::HopsExceeded);
    }
    let timeout = message
        .parameter(params::BROADCAST_TIMEOUT)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    Ok(Envelope { msgid, hops, timeout })
}

/// Bump the hop counter before forwarding to the next ring of neighbors.
pub fn increment_hops(message: &mut Message) {
    let next = message
        .parameter(params::BROADCAST_HOPS)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
    message.set_parameter(params::BROADCAST_HOPS, next.to_string());
}

/// Append `server_name` to the `broadcast-informed-neighbors` parameter
/// (comma-separated, per spec.md §4.8), used so a receiving node can avoid
/// re-forwarding to a peer that is already known to have the message.
pub fn mark_informed(message: &mut Message, server_name: &str) {
    let mut informed: Vec<String> = message
        .parameter(params::BROADCAST_INFORMED_NEIGHBORS)
        .map(|raw| raw.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    if !informed.iter().any(|s| s == server_name) {
        informed.push(server_name.to_string());
    }
    message.set_parameter(params::BROADCAST_INFORMED_NEIGHBORS, informed.join(","));
}

fn already_informed(message: &Message, server_name: &str) -> bool {
    message
        .parameter(params::BROADCAST_INFORMED_NEIGHBORS)
        .map(|raw| raw.split(',').any(|s| s == server_name))
        .unwrap_or(false)
}

/// Decide the audience for a broadcast-destined message, per spec.md §4.8's
/// three destination-service wildcards:
/// - `.` (BroadcastLocalOnly): local services only, never forwarded.
/// - `*` (BroadcastAll): local services plus every live REMOTE peer not yet
///   informed.
/// - `?` (BroadcastPrivate): local services plus only those REMOTE peers
///   whose address is classified private (spec.md §4.1 `AddressClass`).
pub fn plan(
    destination_service: &DestinationService,
    registry: &Registry,
    local_server_name: &str,
) -> BroadcastPlan {
    match destination_service {
        DestinationService::BroadcastLocalOnly => BroadcastPlan {
            deliver_local: true,
            forward_to: Vec::new(),
        },
        DestinationService::BroadcastAll => BroadcastPlan {
            deliver_local: true,
            forward_to: registry.remote_endpoints().map(|(id, _)| id).collect(),
        },
        DestinationService::BroadcastPrivate => BroadcastPlan {
            deliver_local: true,
            forward_to: registry
                .remote_endpoints()
                .filter(|(_, ep)| {
                    ep.peer_address
                        .map(|addr| {
                            matches!(
                                crate::address::AddressClass::classify(&addr.ip()),
                                crate::address::AddressClass::Private
                                    | crate::address::AddressClass::Loopback
                            )
                        })
                        .unwrap_or(false)
                })
                .map(|(id, _)| id)
                .collect(),
        },
        _ => {
            let _ = local_server_name;
            BroadcastPlan {
                deliver_local: false,
                forward_to: Vec::new(),
            }
        }
    }
}

/// Filter the planned forwarding audience down to peers not already listed
/// in `broadcast-informed-neighbors`, so a node that has already told a
/// neighbor about this message doesn't tell it again on every hop.
pub fn exclude_already_informed(
    plan: BroadcastPlan,
    registry: &Registry,
    message: &Message,
) -> BroadcastPlan {
    let forward_to = plan
        .forward_to
        .into_iter()
        .filter(|id| {
            registry
                .get(*id)
                .and_then(|ep| ep.server_name.as_deref())
                .map(|name| !already_informed(message, name))
                .unwrap_or(true)
        })
        .collect();
    BroadcastPlan {
        deliver_local: plan.deliver_local,
        forward_to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionType, Direction, Endpoint, Role, TransportKind};

    fn remote(server_name: &str, addr: &str) -> Endpoint {
        let mut ep = Endpoint::new(TransportKind::Stream, Direction::Outbound, Role::OutboundPeer);
        ep.server_name = Some(server_name.to_string());
        ep.connection_type = ConnectionType::Remote;
        ep.peer_address = Some(addr.parse().unwrap());
        ep
    }

    #[test]
    fn stamp_new_broadcast_fills_in_defaults() {
        let message = stamp_new_broadcast(Message::new("STATUS"), "n1");
        assert!(message.has_parameter(params::BROADCAST_MSGID));
        assert_eq!(message.parameter(params::BROADCAST_HOPS), Some("0"));
        assert_eq!(message.parameter(params::BROADCAST_ORIGINATOR), Some("n1"));
    }

    #[test]
    fn envelope_rejects_excess_hops() {
        let message = Message::new("STATUS")
            .with_parameter(params::BROADCAST_MSGID, "id1")
            .with_parameter(params::BROADCAST_HOPS, "6");
        assert_eq!(read_envelope(&message), Err(EnvelopeError::HopsExceeded));
    }

    #[test]
    fn seen_table_reports_first_observation_only() {
        let mut table = SeenTable::new();
        let now = Instant::now();
        assert!(table.observe("id1", now + Duration::from_secs(10)));
        assert!(!table.observe("id1", now + Duration::from_secs(10)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn seen_table_sweep_drops_expired_entries() {
        let mut table = SeenTable::new();
        let now = Instant::now();
        table.observe("id1", now + Duration::from_secs(1));
        table.sweep(now + Duration::from_secs(2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn broadcast_local_only_never_forwards() {
        let mut registry = Registry::new();
        registry.insert(remote("n2", "10.0.0.2:4040"));
        let plan = plan(&DestinationService::BroadcastLocalOnly, &registry, "n1");
        assert!(plan.deliver_local);
        assert!(plan.forward_to.is_empty());
    }

    #[test]
    fn broadcast_all_forwards_to_every_remote() {
        let mut registry = Registry::new();
        registry.insert(remote("n2", "10.0.0.2:4040"));
        registry.insert(remote("n3", "8.8.8.8:4040"));
        let plan = plan(&DestinationService::BroadcastAll, &registry, "n1");
        assert_eq!(plan.forward_to.len(), 2);
    }

    #[test]
    fn broadcast_private_excludes_public_peers() {
        let mut registry = Registry::new();
        registry.insert(remote("n2", "10.0.0.2:4040"));
        registry.insert(remote("n3", "8.8.8.8:4040"));
        let plan = plan(&DestinationService::BroadcastPrivate, &registry, "n1");
        assert_eq!(plan.forward_to.len(), 1);
    }

    #[test]
    fn exclude_already_informed_drops_listed_neighbor() {
        let mut registry = Registry::new();
        let id = registry.insert(remote("n2", "10.0.0.2:4040"));
        let message = Message::new("STATUS")
            .with_parameter(params::BROADCAST_INFORMED_NEIGHBORS, "n2");
        let plan = BroadcastPlan {
            deliver_local: true,
            forward_to: vec![id],
        };
        let filtered = exclude_already_informed(plan, &registry, &message);
        assert!(filtered.forward_to.is_empty());
    }

    #[test]
    fn mark_informed_appends_without_duplicating() {
        let mut message = Message::new("STATUS");
        mark_informed(&mut message, "n2");
        mark_informed(&mut message, "n2");
        assert_eq!(
            message.parameter(params::BROADCAST_INFORMED_NEIGHBORS),
            Some("n2")
        );
    }
}
