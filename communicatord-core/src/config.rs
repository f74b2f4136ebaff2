//! Inert broker configuration (spec.md §6). Parsing command-line flags and
//! config files is explicitly out of the core's scope (spec.md §1) and
//! lives in the `communicatord` binary crate; this struct is what that
//! layer populates and hands to [`crate::broker::Broker::new`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::address::ConnectionAddress;

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub certificate_pem_path: PathBuf,
    pub private_key_pem_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub local_listen: Option<ConnectionAddress>,
    pub remote_listen: Option<ConnectionAddress>,
    pub secure_listen: Option<(ConnectionAddress, TlsMaterial)>,
    pub unix_listen: Option<ConnectionAddress>,
    pub signal_listen: Option<ConnectionAddress>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub server_name: String,
    pub my_address: SocketAddr,
    pub listeners: ListenerConfig,
    pub max_connections: usize,
    pub max_pending_connections: usize,
    pub neighbors: Vec<SocketAddr>,
    pub signal_secret: Option<String>,
    pub data_path: PathBuf,
    pub debug_all_messages: bool,
    /// Services this node is configured to host, even before any of them
    /// has registered (spec.md §4.6 step 3: "known local service").
    pub locally_configured_services: HashSet<String>,
}

impl BrokerConfig {
    pub fn neighbor_store_path(&self) -> PathBuf {
        self.data_path.join("neighbors.txt")
    }

    pub fn cluster_status_path(&self) -> PathBuf {
        self.data_path.join("cluster-status.txt")
    }
}
