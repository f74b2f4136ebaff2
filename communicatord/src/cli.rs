//! Command-line configuration (spec.md §6). Parsing flags into a
//! [`communicatord_core::BrokerConfig`] is this binary's job — the core
//! crate never depends on `clap` (spec.md §1).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use communicatord_core::address::ConnectionAddress;
use communicatord_core::config::{BrokerConfig, ListenerConfig, TlsMaterial};

#[derive(Debug, Parser)]
#[command(name = "communicatord", about = "Process-local and cluster-wide message broker daemon")]
pub struct Cli {
    /// This node's name, used to identify it to its cluster peers.
    #[arg(long)]
    pub server_name: String,

    /// This node's own address, used for the half-graph connect rule
    /// (spec.md §4.7) and cluster status reporting.
    #[arg(long)]
    pub my_address: SocketAddr,

    /// Listener for local (same-machine) service connections, e.g.
    /// `plain-tcp://127.0.0.1:4040`.
    #[arg(long)]
    pub local_listen: Option<String>,

    /// Listener for unencrypted inter-node connections.
    #[arg(long)]
    pub remote_listen: Option<String>,

    /// Listener for TLS-protected inter-node connections.
    #[arg(long)]
    pub secure_listen: Option<String>,

    /// Certificate PEM path, required when `--secure-listen` is set.
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    /// Private key PEM path, required when `--secure-listen` is set.
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Unix-domain socket listener for local service connections.
    #[arg(long)]
    pub unix_listen: Option<String>,

    /// UDP signal listener, e.g. `udp://127.0.0.1:4041`.
    #[arg(long)]
    pub signal: Option<String>,

    /// Shared secret required on every signal datagram (spec.md §6).
    #[arg(long)]
    pub signal_secret: Option<String>,

    /// Known cluster peer addresses to seed the neighbor store with.
    #[arg(long, value_delimiter = ',')]
    pub neighbors: Vec<SocketAddr>,

    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    #[arg(long, default_value_t = 100)]
    pub max_pending_connections: usize,

    /// Service names this node hosts, even before they have registered
    /// (spec.md §4.6 step 3).
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,

    /// Directory for persisted state: `neighbors.txt`, `cluster-status.txt`.
    #[arg(long, default_value = "/var/lib/communicatord")]
    pub data_path: PathBuf,

    #[arg(long)]
    pub debug_all_messages: bool,

    /// Drop privileges to this user after binding listener sockets.
    #[arg(long)]
    pub user_name: Option<String>,

    #[arg(long)]
    pub group_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CliConfigError {
    #[error("invalid connection spec {0:?}: {1}")]
    InvalidAddress(String, communicatord_core::address::AddressError),
    #[error("--secure-listen requires both --certificate and --private-key")]
    MissingTlsMaterial,
}

impl Cli {
    pub fn into_broker_config(self) -> Result<BrokerConfig, CliConfigError> {
        let parse = |spec: &str| -> Result<ConnectionAddress, CliConfigError> {
            ConnectionAddress::parse(spec).map_err(|err| CliConfigError::InvalidAddress(spec.to_string(), err))
        };

        let local_listen = self.local_listen.as_deref().map(parse).transpose()?;
        let remote_listen = self.remote_listen.as_deref().map(parse).transpose()?;
        let unix_listen = self.unix_listen.as_deref().map(parse).transpose()?;
        let signal_listen = self.signal.as_deref().map(parse).transpose()?;

        let secure_listen = match (&self.secure_listen, &self.certificate, &self.private_key) {
            (Some(spec), Some(cert), Some(key)) => Some((
                parse(spec)?,
                TlsMaterial {
                    certificate_pem_path: cert.clone(),
                    private_key_pem_path: key.clone(),
                },
            )),
            (None, None, None) => None,
            _ => return Err(CliConfigError::MissingTlsMaterial),
        };

        Ok(BrokerConfig {
            server_name: self.server_name,
            my_address: self.my_address,
            listeners: ListenerConfig {
                local_listen,
                remote_listen,
                secure_listen,
                unix_listen,
                signal_listen,
            },
            max_connections: self.max_connections,
            max_pending_connections: self.max_pending_connections,
            neighbors: self.neighbors,
            signal_secret: self.signal_secret,
            data_path: self.data_path,
            debug_all_messages: self.debug_all_messages,
            locally_configured_services: self.services.into_iter().collect::<HashSet<_>>(),
        })
    }
}
