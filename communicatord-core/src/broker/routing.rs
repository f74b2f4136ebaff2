//! Routing & forwarding (spec.md §4.6). Pure decision logic over the
//! registry; the broker applies the decision (actually sending, caching,
//! or broadcasting).

use std::collections::HashSet;

use crate::message::{DestinationService, Message};
use crate::registry::{EndpointId, Registry};

/// What to do with a non-broadcast message, per the routing steps in
/// spec.md §4.6. Broadcast destinations are handled separately by
/// `broker::broadcast` (step 1 dispatches there before this module runs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Step 2: deliver directly to a live local-service endpoint.
    DeliverLocal(EndpointId),
    /// Step 3: no local match, but the service is locally-configured and we
    /// own it — cache the message (and reply if requested).
    Cache,
    /// Step 4: forward through a specific REMOTE endpoint that claims the
    /// service.
    ForwardTo(EndpointId),
    /// Step 5: this is the owning node and the service is neither local nor
    /// known-local — drop.
    DropUnknownService,
    /// Step 6: fall back to flooding all REMOTE endpoints.
    FloodAllRemotes,
    /// The message is structurally invalid (spec.md §3 invariant) and must
    /// be dropped without further processing.
    InvalidDropped,
}

/// Decide how to route `message`, given the local node's `this_server_name`
/// and the set of services this node is configured to host.
pub fn decide(
    message: &Message,
    registry: &Registry,
    this_server_name: &str,
    locally_configured_services: &HashSet<String>,
) -> RoutingDecision {
    if message.is_routing_invalid() {
        return RoutingDecision::InvalidDropped;
    }

    let dest_service = match &message.destination_service {
        DestinationService::Named(name) => name.as_str(),
        // LocalDaemon (addressed to the broker itself) is handled by the
        // dispatcher before routing is ever consulted; broadcast variants
        // are handled by `broker::broadcast`.
        _ => return RoutingDecision::DropUnknownService,
    };

    let dest_server = message.destination_server.render_for_routing();

    // Step 2: a live local-service match.
    if let Some(id) = registry.find_local_service(dest_server, dest_service) {
        return RoutingDecision::DeliverLocal(id);
    }

    let server_matches_us = dest_server.is_empty() || dest_server == this_server_name;

    // Step 3: known-local service, not yet registered.
    if server_matches_us && locally_configured_services.contains(dest_service) {
        return RoutingDecision::Cache;
    }

    // Step 4: a REMOTE endpoint claims this service.
    if let Some(id) = find_remote_claiming_service(registry, dest_service) {
        return RoutingDecision::ForwardTo(id);
    }

    // Step 5: we are the addressed node and have no idea about this service.
    if server_matches_us {
        return RoutingDecision::DropUnknownService;
    }

    // Step 6: fall back to flooding.
    RoutingDecision::FloodAllRemotes
}

/// Step 4's "any may be chosen — implementations should spread load across
/// them": a simple round-robin-by-hash-of-service would also satisfy this;
/// picking the first live match keeps the decision deterministic and easy
/// to test, while `find_remote_claiming_service` is the single seam a
/// future load-spreading strategy would change.
fn find_remote_claiming_service(registry: &Registry, service: &str) -> Option<EndpointId> {
    registry
        .remote_endpoints()
        .find(|(_, ep)| ep.understands(service))
        .map(|(id, _)| id)
}

trait RenderForRouting {
    fn render_for_routing(&self) -> &str;
}

impl RenderForRouting for crate::message::DestinationServer {
    fn render_for_routing(&self) -> &str {
        use crate::message::DestinationServer::*;
        match self {
            Unspecified => "",
            This => "",
            All => "*",
            Named(name) => name.as_str(),
        }
    }
}
