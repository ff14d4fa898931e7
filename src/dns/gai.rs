//! System resolver backed by `getaddrinfo`, run on tokio's blocking pool.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{
    io,
    net::{IpAddr, Ipv6Addr, ToSocketAddrs},
};

#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let domain = name.as_str().to_string();
            if let Some(ip) = parse_ip_literal(&domain) {
                return Ok(Box::new(std::iter::once(ip)) as Addrs);
            }

            let host = domain.clone();
            let joined = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.map(|a| a.ip()).collect::<Vec<_>>())
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "resolver task failed");
                NetError::NameNotResolved
            })?;

            let mut addrs = joined.dns_context(&domain)?;
            dedup_in_order(&mut addrs);
            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    &domain,
                    io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
                ));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Parse `host` as an IP literal, accepting bracketed IPv6 (`[::1]`).
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    host.parse::<IpAddr>().ok()
}

// getaddrinfo reports one entry per socket type.
fn dedup_in_order(addrs: &mut Vec<IpAddr>) {
    let mut seen = Vec::with_capacity(addrs.len());
    addrs.retain(|ip| {
        if seen.contains(ip) {
            false
        } else {
            seen.push(*ip);
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ip_literal() {
        assert_eq!(parse_ip_literal("127.0.0.1"), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(parse_ip_literal("::1"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(parse_ip_literal("[::1]"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(parse_ip_literal("example.com"), None);
        assert_eq!(parse_ip_literal("[127.0.0.1]"), None);
    }

    #[test]
    fn test_dedup_keeps_first_order() {
        let a = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let b = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let mut addrs = vec![a, a, b, a, b];
        dedup_in_order(&mut addrs);
        assert_eq!(addrs, vec![a, b]);
    }

    #[tokio::test]
    async fn test_literal_skips_lookup() {
        let addrs: Vec<_> = GaiResolver::new().resolve(Name::new("10.1.2.3")).await.unwrap().collect();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]);
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let addrs: Vec<_> = GaiResolver::new().resolve(Name::new("localhost")).await.unwrap().collect();
        assert!(!addrs.is_empty());
    }
}
