//! Turning peer addresses into dialable endpoints.

use std::net::IpAddr;

use braid_core::{Endpoint, PeerAddress};

use crate::error::{P2pError, Result};

/// Port assumed when a networked address omits one.
pub const DEFAULT_PORT: u16 = 26656;

/// Resolve `address` into endpoints, looking up DNS names as needed.
///
/// Path-only addresses resolve to a single local endpoint whose path is the
/// address path, or the peer id in hex.
pub async fn resolve(address: &PeerAddress) -> Result<Vec<Endpoint>> {
    let Some(host) = &address.hostname else {
        let path = address
            .path
            .clone()
            .unwrap_or_else(|| address.peer_id.to_hex());
        return Ok(vec![Endpoint::local(address.protocol.clone(), path)]);
    };
    let port = address.port.unwrap_or(DEFAULT_PORT);

    let with_path = |mut endpoint: Endpoint| {
        endpoint.path = address.path.clone();
        endpoint
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![with_path(Endpoint::networked(
            address.protocol.clone(),
            ip,
            port,
        ))]);
    }

    let resolve_err = |reason: String| P2pError::Resolve {
        address: address.to_string(),
        reason,
    };
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;

    let mut endpoints: Vec<Endpoint> = Vec::new();
    for addr in addrs {
        let endpoint = with_path(Endpoint::networked(
            address.protocol.clone(),
            addr.ip(),
            addr.port(),
        ));
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    if endpoints.is_empty() {
        return Err(resolve_err("no addresses found".into()));
    }
    tracing::trace!(%address, count = endpoints.len(), "resolved peer address");
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{PeerId, Protocol};

    const ID: &str = "0102030405060708090a0b0c0d0e0f1011121314";

    #[tokio::test]
    async fn test_ip_literal_needs_no_lookup() {
        let address = PeerAddress::parse(&format!("mconn://{}@192.0.2.7", ID)).unwrap();
        let endpoints = resolve(&address).await.unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::networked(
                Protocol::mconn(),
                "192.0.2.7".parse().unwrap(),
                DEFAULT_PORT
            )]
        );
    }

    #[tokio::test]
    async fn test_memory_address() {
        let address = PeerAddress::parse(&format!("memory:{}", ID)).unwrap();
        let endpoints = resolve(&address).await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::local(Protocol::memory(), ID)]);
        assert_eq!(PeerId::from_hex(ID).unwrap(), address.peer_id);
    }

    #[tokio::test]
    async fn test_localhost_lookup() {
        let address = PeerAddress::parse(&format!("mconn://{}@localhost:4000", ID)).unwrap();
        let endpoints = resolve(&address).await.unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints
            .iter()
            .all(|e| e.port == Some(4000) && e.ip.map_or(false, |ip| ip.is_loopback())));
    }
}
