//! Hostname to IPv4 address resolution.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use thiserror::Error;

/// Resolution error types.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("DNS resolution failed for {hostname}: {source}")]
    Lookup {
        hostname: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no IPv4 addresses found for {hostname}")]
    NoIpv4Addresses { hostname: String },
}

/// Turns a hostname into a deduplicated set of IPv4 addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<BTreeSet<Ipv4Addr>, ResolutionError>;
}

/// Resolver backed by the system's `getaddrinfo` via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<BTreeSet<Ipv4Addr>, ResolutionError> {
        let hostname = hostname.trim();
        if hostname.is_empty() || hostname.contains(char::is_whitespace) {
            return Err(ResolutionError::InvalidHostname(hostname.to_string()));
        }

        // Literal addresses skip the lookup
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(BTreeSet::from([ip]));
        }

        let addrs = tokio::net::lookup_host(format!("{}:0", hostname))
            .await
            .map_err(|source| ResolutionError::Lookup {
                hostname: hostname.to_string(),
                source,
            })?;

        collect_ipv4(hostname, addrs.map(|sa| sa.ip()))
    }
}

/// Keep IPv4 results only, deduplicated.
pub fn collect_ipv4(
    hostname: &str,
    addrs: impl IntoIterator<Item = IpAddr>,
) -> Result<BTreeSet<Ipv4Addr>, ResolutionError> {
    let set: BTreeSet<Ipv4Addr> = addrs
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();

    if set.is_empty() {
        return Err(ResolutionError::NoIpv4Addresses {
            hostname: hostname.to_string(),
        });
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_collect_ipv4_dedup() {
        let a = Ipv4Addr::new(192, 0, 2, 1);
        let b = Ipv4Addr::new(192, 0, 2, 2);
        let addrs = vec![
            IpAddr::V4(b),
            IpAddr::V4(a),
            IpAddr::V4(b),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(a),
        ];
        let set = collect_ipv4("example.net", addrs).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_collect_ipv4_only_v6() {
        let err =
            collect_ipv4("v6.example.net", vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]).unwrap_err();
        assert!(matches!(err, ResolutionError::NoIpv4Addresses { .. }));
    }

    #[test]
    fn test_resolve_literal() {
        let set = tokio_test::block_on(SystemResolver.resolve("127.0.0.1")).unwrap();
        assert_eq!(set, BTreeSet::from([Ipv4Addr::LOCALHOST]));
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty() {
        let err = SystemResolver.resolve("   ").await.unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidHostname(_)));
    }
}
