//! Cluster membership and status (spec.md §4.7): the half-graph connect
//! rule that avoids duplicate links between two nodes that both try to
//! dial each other, neighbor discovery via CONNECT/ACCEPT/GOSSIP, and the
//! quorum-based CLUSTER_UP/DOWN/COMPLETE/INCOMPLETE status persisted to
//! `cluster-status.txt`.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;

use crate::address::address_is_smaller;
use crate::neighbor_store::write_atomically;

/// Whether this node should be the one to initiate a connection to `peer`,
/// given both addresses, per spec.md §4.7: "of the two nodes that could
/// connect to each other, the one with the numerically smaller address
/// initiates the connection; the other one waits to be connected to."
/// This prevents a redundant pair of links forming when both sides attempt
/// to connect simultaneously.
pub fn should_initiate_connection(my_address: SocketAddr, peer_address: SocketAddr) -> bool {
    address_is_smaller(&my_address, &peer_address)
}

/// Cluster-wide status derived from the live neighbor graph (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterState {
    pub up: bool,
    pub complete: bool,
}

impl ClusterState {
    /// A cluster of `known_neighbors` total nodes (this node plus every
    /// address in the neighbor store) is considered UP once at least a
    /// quorum `Q = floor(N / 2) + 1` of them are reachable as live REMOTE
    /// endpoints, and COMPLETE once every known neighbor is connected.
    pub fn derive(known_neighbors: usize, live_remote_count: usize) -> ClusterState {
        // +1 accounts for this node itself being part of the cluster.
        let total_nodes = known_neighbors + 1;
        let quorum = total_nodes / 2 + 1;
        // live_remote_count never includes this node, so compare against
        // the neighbor-only quorum threshold minus the self node.
        let up = live_remote_count + 1 >= quorum;
        let complete = live_remote_count >= known_neighbors;
        ClusterState { up, complete }
    }

    pub fn status_command(&self) -> &'static str {
        match (self.up, self.complete) {
            (true, true) => crate::message::commands::CLUSTER_COMPLETE,
            (true, false) => crate::message::commands::CLUSTER_UP,
            (false, _) => crate::message::commands::CLUSTER_DOWN,
        }
    }
}

/// Render the cluster status file. Kept deliberately simple (one line per
/// field) since nothing but this workspace ever reads it back.
pub fn render_cluster_status(state: ClusterState, connected: &BTreeSet<SocketAddr>) -> String {
    let mut out = String::new();
    out.push_str(if state.up { "up\n" } else { "down\n" });
    out.push_str(if state.complete { "complete\n" } else { "incomplete\n" });
    for addr in connected {
        out.push_str(&addr.to_string());
        out.push('\n');
    }
    out
}

pub fn persist_cluster_status(
    path: &Path,
    state: ClusterState,
    connected: &BTreeSet<SocketAddr>,
) -> std::io::Result<()> {
    write_atomically(path, &render_cluster_status(state, connected))
}

/// Addresses carried by a CONNECT, ACCEPT, or GOSSIP message's
/// `neighbors`/`heard-of` parameter (comma-separated `ip:port` list, per
/// spec.md §4.7), to be merged into the neighbor store.
pub fn parse_heard_of(raw: &str) -> Vec<SocketAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Render a set of addresses for the `neighbors`/`heard-of` parameter of an
/// outgoing CONNECT/ACCEPT/GOSSIP message.
pub fn render_heard_of<'a>(addrs: impl IntoIterator<Item = &'a SocketAddr>) -> String {
    addrs
        .into_iter()
        .map(SocketAddr::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
