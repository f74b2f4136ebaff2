//! Message model and single-line wire codec (spec.md §3, §4.2).

mod wire;

pub use wire::MessageError;

use indexmap::IndexMap;
use std::fmt;

/// Reserved command names (spec.md §6), kept here so the dispatcher and
/// tests can refer to them without typos.
pub mod commands {
    pub const REGISTER: &str = "REGISTER";
    pub const UNREGISTER: &str = "UNREGISTER";
    pub const CONNECT: &str = "CONNECT";
    pub const ACCEPT: &str = "ACCEPT";
    pub const REFUSE: &str = "REFUSE";
    pub const DISCONNECT: &str = "DISCONNECT";
    pub const DISCONNECTING: &str = "DISCONNECTING";
    pub const DISCONNECTED: &str = "DISCONNECTED";
    pub const GOSSIP: &str = "GOSSIP";
    pub const RECEIVED: &str = "RECEIVED";
    pub const HELP: &str = "HELP";
    pub const COMMANDS: &str = "COMMANDS";
    pub const READY: &str = "READY";
    pub const STATUS: &str = "STATUS";
    pub const CLUSTER_STATUS: &str = "CLUSTER_STATUS";
    pub const CLUSTER_UP: &str = "CLUSTER_UP";
    pub const CLUSTER_DOWN: &str = "CLUSTER_DOWN";
    pub const CLUSTER_COMPLETE: &str = "CLUSTER_COMPLETE";
    pub const CLUSTER_INCOMPLETE: &str = "CLUSTER_INCOMPLETE";
    pub const HANGUP: &str = "HANGUP";
    pub const FORGET: &str = "FORGET";
    pub const NEWREMOTECONNECTION: &str = "NEWREMOTECONNECTION";
    pub const STOP: &str = "STOP";
    pub const SHUTDOWN: &str = "SHUTDOWN";
    pub const QUITTING: &str = "QUITTING";
    pub const TRANSMISSION_REPORT: &str = "TRANSMISSION_REPORT";
    pub const UNKNOWN: &str = "UNKNOWN";
    pub const SERVICE_STATUS: &str = "SERVICE_STATUS";
    pub const SERVER_PUBLIC_IP: &str = "SERVER_PUBLIC_IP";
    pub const PUBLIC_IP: &str = "PUBLIC_IP";
}

/// Protocol major version this broker speaks. `CONNECT`/`REGISTER` carry
/// this as their `version` parameter; a mismatch against the peer's value
/// is a protocol error (spec.md §6 "Version negotiation").
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known parameter names, including the broadcast envelope (spec.md §3).
pub mod params {
    pub const CACHE: &str = "cache";
    pub const VERSION: &str = "version";
    pub const BROADCAST_MSGID: &str = "broadcast-msgid";
    pub const BROADCAST_HOPS: &str = "broadcast-hops";
    pub const BROADCAST_TIMEOUT: &str = "broadcast-timeout";
    pub const BROADCAST_ORIGINATOR: &str = "broadcast-originator";
    pub const BROADCAST_INFORMED_NEIGHBORS: &str = "broadcast-informed-neighbors";
}

/// `destination-server` per spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationServer {
    /// Empty: unqualified, routed purely by service name.
    Unspecified,
    /// `.` — this node.
    This,
    /// `*` — all nodes.
    All,
    /// An explicit server name.
    Named(String),
}

impl DestinationServer {
    fn parse(raw: &str) -> Self {
        match raw {
            "" => DestinationServer::Unspecified,
            "." => DestinationServer::This,
            "*" => DestinationServer::All,
            other => DestinationServer::Named(other.to_string()),
        }
    }

    fn render(&self) -> &str {
        match self {
            DestinationServer::Unspecified => "",
            DestinationServer::This => ".",
            DestinationServer::All => "*",
            DestinationServer::Named(name) => name,
        }
    }

    /// True for the two wildcard spellings the invariant in spec.md §3
    /// calls out (`*` or `?`) even though `?` is not otherwise a defined
    /// destination-server value; kept literal to the spec's wording.
    pub fn is_broadcast_wildcard(raw: &str) -> bool {
        raw == "*" || raw == "?"
    }
}

/// `destination-service` per spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationService {
    /// Empty: the local daemon itself.
    LocalDaemon,
    /// An explicit service name.
    Named(String),
    /// `*` — broadcast to local services and peers.
    BroadcastAll,
    /// `?` — broadcast to local services and forward to private peers only.
    BroadcastPrivate,
    /// `.` — broadcast to local services only.
    BroadcastLocalOnly,
}

impl DestinationService {
    fn parse(raw: &str) -> Self {
        match raw {
            "" => DestinationService::LocalDaemon,
            "*" => DestinationService::BroadcastAll,
            "?" => DestinationService::BroadcastPrivate,
            "." => DestinationService::BroadcastLocalOnly,
            other => DestinationService::Named(other.to_string()),
        }
    }

    fn render(&self) -> &str {
        match self {
            DestinationService::LocalDaemon => "",
            DestinationService::Named(name) => name,
            DestinationService::BroadcastAll => "*",
            DestinationService::BroadcastPrivate => "?",
            DestinationService::BroadcastLocalOnly => ".",
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            DestinationService::BroadcastAll
                | DestinationService::BroadcastPrivate
                | DestinationService::BroadcastLocalOnly
        )
    }
}

/// A single broker message: command, routing headers, and an
/// insertion-ordered parameter map (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub sent_from_server: String,
    pub sent_from_service: String,
    pub destination_server: DestinationServer,
    pub destination_service: DestinationService,
    parameters: IndexMap<String, String>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sent_from_server: String::new(),
            sent_from_service: String::new(),
            destination_server: DestinationServer::Unspecified,
            destination_service: DestinationService::LocalDaemon,
            parameters: IndexMap::new(),
        }
    }

    pub fn with_destination(
        mut self,
        server: DestinationServer,
        service: DestinationService,
    ) -> Self {
        self.destination_server = server;
        self.destination_service = service;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<String> {
        self.parameters.shift_remove(name)
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Stamp the sent-from fields if they are currently empty, per the
    /// forwarding rule in spec.md §4.6 ("stamps sent-from-server=this-node,
    /// sent-from-service=the-name if those are empty").
    pub fn stamp_origin_if_empty(&mut self, server: &str, service: &str) {
        if self.sent_from_server.is_empty() {
            self.sent_from_server = server.to_string();
        }
        if self.sent_from_service.is_empty() {
            self.sent_from_service = service.to_string();
        }
    }

    /// Invariant from spec.md §3: a message whose destination-server is the
    /// broadcast wildcard spelling while destination-service names a single,
    /// non-broadcast service is invalid and must be dropped.
    pub fn is_routing_invalid(&self) -> bool {
        let server_is_wildcard =
            DestinationServer::is_broadcast_wildcard(self.destination_server.render());
        server_is_wildcard
            && !matches!(self.destination_service, DestinationService::LocalDaemon)
            && !self.destination_service.is_broadcast()
    }

    pub fn to_wire(&self) -> String {
        wire::serialize(self)
    }

    pub fn parse(line: &str) -> Result<Message, MessageError> {
        wire::parse(line)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
