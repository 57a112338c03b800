//! Transport endpoints and peer addresses.
//!
//! An [`Endpoint`] is something a transport can dial directly. A
//! [`PeerAddress`] is what operators write in configuration: it names the
//! expected peer and a host that may need name resolution before it turns
//! into one or more endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::CoreError;
use crate::peer::PeerId;

/// Transport protocol name, e.g. `mconn` or `memory`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Protocol(pub String);

impl Protocol {
    /// In-process transport.
    pub const MEMORY: &'static str = "memory";
    /// TCP transport using the legacy packet framing.
    pub const MCONN: &'static str = "mconn";

    pub fn memory() -> Self {
        Self(Self::MEMORY.to_string())
    }

    pub fn mconn() -> Self {
        Self(Self::MCONN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A transport-specific address for a single connection.
///
/// Networked endpoints carry an IP (and usually a port). Non-networked
/// endpoints, such as in-process ones, carry only a path and must only be
/// advertised to peers speaking the same protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub path: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Endpoint {
    /// A networked endpoint.
    pub fn networked(protocol: Protocol, ip: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            path: None,
            ip: Some(ip),
            port: Some(port),
        }
    }

    /// A path-only endpoint.
    pub fn local(protocol: Protocol, path: impl Into<String>) -> Self {
        Self {
            protocol,
            path: Some(path.into()),
            ip: None,
            port: None,
        }
    }

    /// Whether this endpoint is reachable over a network.
    pub fn is_networked(&self) -> bool {
        self.ip.is_some()
    }

    /// Check structural validity.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.protocol.0.is_empty() {
            return Err(CoreError::InvalidEndpoint("empty protocol".into()));
        }
        if self.ip.is_none() && self.path.as_deref().map_or(true, str::is_empty) {
            return Err(CoreError::InvalidEndpoint(
                "endpoint has neither IP nor path".into(),
            ));
        }
        if self.ip.is_none() && self.port.is_some() {
            return Err(CoreError::InvalidEndpoint("port without IP".into()));
        }
        Ok(())
    }

    /// The socket address of a networked endpoint.
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        match (self.ip, self.port) {
            (Some(ip), Some(port)) => Some(std::net::SocketAddr::new(ip, port)),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(IpAddr::V6(ip)) => write!(f, "{}://[{}]", self.protocol, ip)?,
            Some(IpAddr::V4(ip)) => write!(f, "{}://{}", self.protocol, ip)?,
            None => {
                return write!(
                    f,
                    "{}:{}",
                    self.protocol,
                    self.path.as_deref().unwrap_or_default()
                )
            }
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{}", path.trim_start_matches('/'))?;
        }
        Ok(())
    }
}

/// A URL-like peer address: `mconn://<peer-id>@host:port` or
/// `memory:<peer-id>`.
///
/// A bare `<peer-id>@host:port` defaults to the `mconn` protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub protocol: Protocol,
    pub peer_id: PeerId,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl PeerAddress {
    /// Build an address that points at a known endpoint.
    pub fn from_endpoint(peer_id: PeerId, endpoint: &Endpoint) -> Self {
        Self {
            protocol: endpoint.protocol.clone(),
            peer_id,
            hostname: endpoint.ip.map(|ip| ip.to_string()),
            port: endpoint.port,
            path: endpoint.path.clone(),
        }
    }

    /// Whether the host needs name resolution (is not an IP literal).
    pub fn needs_resolution(&self) -> bool {
        match &self.hostname {
            Some(host) => host.parse::<IpAddr>().is_err(),
            None => false,
        }
    }

    /// Parse an address string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty address"));
        }

        let (protocol, rest) = match s.find("://") {
            Some(i) => (&s[..i], &s[i + 3..]),
            None if s.contains('@') => (Protocol::MCONN, s),
            None => {
                // Opaque form, `memory:<peer-id>`.
                let (protocol, opaque) = s
                    .split_once(':')
                    .ok_or_else(|| invalid("missing protocol"))?;
                let peer_id =
                    PeerId::from_hex(opaque).map_err(|e| invalid(&e.to_string()))?;
                return Ok(Self {
                    protocol: Protocol::from(protocol),
                    peer_id,
                    hostname: None,
                    port: None,
                    path: Some(opaque.to_string()),
                });
            }
        };
        if protocol.is_empty() {
            return Err(invalid("empty protocol"));
        }

        let (id, host_part) = rest
            .split_once('@')
            .ok_or_else(|| invalid("missing peer id"))?;
        let peer_id = PeerId::from_hex(id).map_err(|e| invalid(&e.to_string()))?;

        let (host_port, path) = match host_part.find('/') {
            Some(i) => (&host_part[..i], Some(host_part[i + 1..].to_string())),
            None => (host_part, None),
        };

        let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| invalid("invalid port"))?),
                None if tail.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 literal")),
            };
            (host.to_string(), port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, p)) => (
                    host.to_string(),
                    Some(p.parse::<u16>().map_err(|_| invalid("invalid port"))?),
                ),
                None => (host_port.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            protocol: Protocol::from(protocol),
            peer_id,
            hostname: Some(host),
            port,
            path: path.filter(|p| !p.is_empty()),
        })
    }
}

impl FromStr for PeerAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(host) = &self.hostname else {
            return write!(f, "{}:{}", self.protocol, self.peer_id);
        };
        write!(f, "{}://{}@", self.protocol, self.peer_id)?;
        if host.contains(':') {
            write!(f, "[{}]", host)?;
        } else {
            f.write_str(host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{}", path)?;
        }
        Ok(())
    }
}
