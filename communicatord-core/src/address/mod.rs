//! Connection-spec parsing and address classification (spec.md §4.1).
//!
//! A connection spec is a URI-shaped string `<scheme>://<host>:<port>` or,
//! for the Unix-domain scheme, `<scheme>:///<path>`. The scheme fixes the
//! transport (stream vs. datagram) and the security requirement; parsing
//! also classifies the host address so the broker can reject nonsensical
//! combinations (e.g. a public IP on a plain, unencrypted transport) at
//! configuration time.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Wire scheme of a connection spec. `Cdb` is the broadcast-to-peers scheme
/// the original source declares but never wires up (spec.md §9 Open
/// Questions); this workspace treats it as first-class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    PlainTcp,
    SecureTcp,
    Udp,
    UnixStream,
    BroadcastUdp,
    Cdb,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::PlainTcp => "plain-tcp",
            Scheme::SecureTcp => "secure-tcp",
            Scheme::Udp => "udp",
            Scheme::UnixStream => "unix-stream",
            Scheme::BroadcastUdp => "broadcast-udp",
            Scheme::Cdb => "cdb",
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self {
            Scheme::PlainTcp | Scheme::SecureTcp | Scheme::UnixStream => TransportKind::Stream,
            Scheme::Udp | Scheme::BroadcastUdp | Scheme::Cdb => TransportKind::Datagram,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::SecureTcp)
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain-tcp" => Ok(Scheme::PlainTcp),
            "secure-tcp" => Ok(Scheme::SecureTcp),
            "udp" => Ok(Scheme::Udp),
            "unix-stream" => Ok(Scheme::UnixStream),
            "broadcast-udp" => Ok(Scheme::BroadcastUdp),
            "cdb" => Ok(Scheme::Cdb),
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

/// Network classification of a host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    Private,
    Public,
    Multicast,
    Broadcast,
}

impl AddressClass {
    pub fn classify(ip: &IpAddr) -> AddressClass {
        match ip {
            IpAddr::V4(v4) => classify_v4(*v4),
            IpAddr::V6(v6) => classify_v6(*v6),
        }
    }
}

fn classify_v4(v4: Ipv4Addr) -> AddressClass {
    if v4.is_loopback() {
        return AddressClass::Loopback;
    }
    if v4 == Ipv4Addr::new(255, 255, 255, 255) {
        return AddressClass::Broadcast;
    }
    if v4.is_multicast() {
        return AddressClass::Multicast;
    }
    if v4.is_private() || v4.is_link_local() {
        return AddressClass::Private;
    }
    // Directed broadcast addresses (host bits all-1 within a private block)
    // are common on LANs; treat the conventional /24 broadcast pattern as
    // Broadcast rather than Public.
    let octets = v4.octets();
    if octets[3] == 255 && (v4.is_private() || v4.is_link_local()) {
        return AddressClass::Broadcast;
    }
    AddressClass::Public
}

fn classify_v6(v6: Ipv6Addr) -> AddressClass {
    if v6.is_loopback() {
        return AddressClass::Loopback;
    }
    if v6.is_multicast() {
        return AddressClass::Multicast;
    }
    // fc00::/7 unique local addresses
    if (v6.segments()[0] & 0xfe00) == 0xfc00 {
        return AddressClass::Private;
    }
    AddressClass::Public
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("malformed connection spec: {0}")]
    Malformed(String),
    #[error("unix-stream path must be absolute: {0}")]
    RelativeUnixPath(String),
    #[error("public address {0} is not allowed on a plain transport")]
    PublicOnPlain(String),
    #[error("address {0} is not a valid target for scheme {1}")]
    InvalidClassForScheme(String, &'static str),
}

/// A parsed, validated connection spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddress {
    pub scheme: Scheme,
    pub host: HostKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    Socket(SocketAddr),
    UnixPath(String),
}

impl ConnectionAddress {
    /// Parse and validate a connection spec string, applying the
    /// scheme-specific address-class rules from spec.md §4.1's table.
    pub fn parse(spec: &str) -> Result<ConnectionAddress, AddressError> {
        let (scheme_str, rest) = spec
            .split_once("://")
            .ok_or_else(|| AddressError::Malformed(spec.to_string()))?;
        let scheme = Scheme::from_str(scheme_str)?;

        let host = match scheme {
            Scheme::UnixStream => {
                let path = rest.strip_prefix('/').map(|p| format!("/{p}")).unwrap_or_else(|| rest.to_string());
                if !path.starts_with('/') {
                    return Err(AddressError::RelativeUnixPath(path));
                }
                HostKind::UnixPath(path)
            }
            _ => {
                let addr: SocketAddr = rest
                    .parse()
                    .map_err(|_| AddressError::Malformed(spec.to_string()))?;
                HostKind::Socket(addr)
            }
        };

        let address = ConnectionAddress { scheme, host };
        address.validate()?;
        Ok(address)
    }

    pub fn class(&self) -> Option<AddressClass> {
        match &self.host {
            HostKind::Socket(addr) => Some(AddressClass::classify(&addr.ip())),
            HostKind::UnixPath(_) => None,
        }
    }

    fn validate(&self) -> Result<(), AddressError> {
        match self.scheme {
            Scheme::PlainTcp => match self.class() {
                Some(AddressClass::Loopback) | Some(AddressClass::Private) => Ok(()),
                Some(AddressClass::Public) => {
                    Err(AddressError::PublicOnPlain(self.to_string()))
                }
                _ => Err(AddressError::InvalidClassForScheme(self.to_string(), "plain-tcp")),
            },
            Scheme::SecureTcp => match self.class() {
                Some(AddressClass::Loopback)
                | Some(AddressClass::Private)
                | Some(AddressClass::Public) => Ok(()),
                _ => Err(AddressError::InvalidClassForScheme(self.to_string(), "secure-tcp")),
            },
            Scheme::Udp => match self.class() {
                Some(AddressClass::Loopback)
                | Some(AddressClass::Private)
                | Some(AddressClass::Multicast) => Ok(()),
                _ => Err(AddressError::InvalidClassForScheme(self.to_string(), "udp")),
            },
            Scheme::BroadcastUdp | Scheme::Cdb => match self.class() {
                Some(AddressClass::Broadcast) | Some(AddressClass::Multicast) => Ok(()),
                _ => Err(AddressError::InvalidClassForScheme(self.to_string(), "broadcast-udp")),
            },
            Scheme::UnixStream => match &self.host {
                HostKind::UnixPath(p) if p.starts_with('/') => Ok(()),
                HostKind::UnixPath(p) => Err(AddressError::RelativeUnixPath(p.clone())),
                HostKind::Socket(_) => unreachable!("unix-stream always parses to UnixPath"),
            },
        }
    }

    /// True if this address, used with `secure-tcp`, deserves a startup
    /// warning (loopback TLS is allowed but pointless) per the §4.1 table.
    pub fn warrants_loopback_tls_warning(&self) -> bool {
        self.scheme.is_secure() && self.class() == Some(AddressClass::Loopback)
    }

    /// Canonical `ip:port` rendering used for neighbor-set bookkeeping.
    pub fn canonical(&self) -> String {
        match &self.host {
            HostKind::Socket(addr) => addr.to_string(),
            HostKind::UnixPath(path) => path.clone(),
        }
    }
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostKind::Socket(addr) => write!(f, "{}://{}", self.scheme, addr),
            HostKind::UnixPath(path) => write!(f, "{}://{}", self.scheme, path),
        }
    }
}

/// Compare two `ip:port` addresses the way the half-graph connect rule
/// (spec.md §4.7) requires: plain numeric/lexicographic ordering of the
/// canonical socket address is enough since both sides compute it the same
/// way.
pub fn address_is_smaller(a: &SocketAddr, b: &SocketAddr) -> bool {
    (a.ip(), a.port()) < (b.ip(), b.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_tcp_loopback() {
        let addr = ConnectionAddress::parse("plain-tcp://127.0.0.1:4040").unwrap();
        assert_eq!(addr.scheme, Scheme::PlainTcp);
        assert_eq!(addr.class(), Some(AddressClass::Loopback));
    }

    #[test]
    fn rejects_public_on_plain_tcp() {
        let err = ConnectionAddress::parse("plain-tcp://8.8.8.8:4040").unwrap_err();
        assert!(matches!(err, AddressError::PublicOnPlain(_)));
    }

    #[test]
    fn allows_public_on_secure_tcp() {
        let addr = ConnectionAddress::parse("secure-tcp://8.8.8.8:4041").unwrap();
        assert_eq!(addr.class(), Some(AddressClass::Public));
    }

    #[test]
    fn warns_on_loopback_secure_tcp() {
        let addr = ConnectionAddress::parse("secure-tcp://127.0.0.1:4041").unwrap();
        assert!(addr.warrants_loopback_tls_warning());
    }

    #[test]
    fn parses_unix_stream_absolute_path() {
        let addr = ConnectionAddress::parse("unix-stream:///run/communicatord.sock").unwrap();
        assert_eq!(addr.canonical(), "/run/communicatord.sock");
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = ConnectionAddress::parse("ftp://127.0.0.1:21").unwrap_err();
        assert!(matches!(err, AddressError::UnknownScheme(_)));
    }

    #[test]
    fn rejects_udp_public() {
        let err = ConnectionAddress::parse("udp://8.8.8.8:4041").unwrap_err();
        assert!(matches!(err, AddressError::InvalidClassForScheme(_, "udp")));
    }

    #[test]
    fn accepts_broadcast_udp_on_broadcast_address() {
        let addr = ConnectionAddress::parse("broadcast-udp://192.168.1.255:4041").unwrap();
        assert_eq!(addr.class(), Some(AddressClass::Broadcast));
    }

    #[test]
    fn smaller_address_rule_is_total_order() {
        let a: SocketAddr = "10.0.0.1:4040".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:4040".parse().unwrap();
        assert!(address_is_smaller(&a, &b));
        assert!(!address_is_smaller(&b, &a));
    }
}
