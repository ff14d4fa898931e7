//! Keyed registry of per-endpoint connection pools.
//!
//! Each (scheme, host, port) group owns one [`Pool`] whose connector runs a
//! [`ConnectJob`] per physical connection. TLS schemes get a TLS stage
//! with ALPN; a connection that negotiates `h2` is shared by up to
//! `multiplex_limit` leases, anything else by one.

use crate::base::neterror::NetError;
use crate::future::{Context, Deferred};
use crate::pool::{Acquire, Connected, Connector, Pool, PoolConfig, PoolStats};
use crate::socket::channel::Channel;
use crate::socket::connectjob::{ConnectJob, TlsRequest};
use crate::socket::proxy::ProxyOptions;
use crate::socket::tls::TlsContextProvider;
use crate::socket::transport::{Address, Transport};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use url::Url;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of leases sharing one multiplexed (h2) connection.
pub const DEFAULT_MULTIPLEX_LIMIT: u32 = 100;

/// Identifies a connection group (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId {
    scheme: String,
    host: String,
    port: u16,
}

impl GroupId {
    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        let scheme = url.scheme().to_ascii_lowercase();
        let Address::Inet { host, port } = Address::from_url(url)? else {
            return Err(NetError::InvalidUrl);
        };
        Ok(GroupId { scheme, host, port })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    pub fn address(&self) -> Address {
        Address::inet(self.host.clone(), self.port)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address())
    }
}

struct Registry<T: Transport> {
    transport: Arc<T>,
    config: PoolConfig,
    proxy: Option<ProxyOptions>,
    tls: Option<Arc<dyn TlsContextProvider<T::Channel>>>,
    multiplex_limit: u32,
    groups: DashMap<GroupId, Pool<T::Channel>>,
    closed: AtomicBool,
}

/// Connection pools keyed by endpoint, sharing one transport, proxy and TLS
/// configuration. Clones share the registry.
pub struct ClientSocketPool<T: Transport> {
    inner: Arc<Registry<T>>,
}

impl<T: Transport> Clone for ClientSocketPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct ClientSocketPoolBuilder<T: Transport> {
    transport: Arc<T>,
    config: PoolConfig,
    proxy: Option<ProxyOptions>,
    tls: Option<Arc<dyn TlsContextProvider<T::Channel>>>,
    multiplex_limit: u32,
}

impl<T: Transport> ClientSocketPoolBuilder<T> {
    /// Per-group pool configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn tls(mut self, provider: Arc<dyn TlsContextProvider<T::Channel>>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Zero is treated as one.
    pub fn multiplex_limit(mut self, limit: u32) -> Self {
        self.multiplex_limit = limit.max(1);
        self
    }

    pub fn build(self) -> ClientSocketPool<T> {
        ClientSocketPool {
            inner: Arc::new(Registry {
                transport: self.transport,
                config: self.config,
                proxy: self.proxy,
                tls: self.tls,
                multiplex_limit: self.multiplex_limit,
                groups: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<T: Transport> ClientSocketPool<T> {
    pub fn builder(transport: T) -> ClientSocketPoolBuilder<T> {
        ClientSocketPoolBuilder {
            transport: Arc::new(transport),
            config: PoolConfig::default(),
            proxy: None,
            tls: None,
            multiplex_limit: DEFAULT_MULTIPLEX_LIMIT,
        }
    }

    /// Acquire a lease on a connection to the endpoint of `url`.
    ///
    /// Fails immediately for URLs without a host, for schemes other than
    /// http(s)/ws(s), for TLS schemes when no TLS provider is configured and
    /// after [`close`](Self::close).
    pub fn request_socket(
        &self,
        context: &Context,
        url: &Url,
    ) -> Result<Acquire<T::Channel>, NetError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(NetError::PoolClosed);
        }
        let group = GroupId::from_url(url)?;
        if !matches!(group.scheme.as_str(), "http" | "https" | "ws" | "wss") {
            return Err(NetError::InvalidUrl);
        }
        if group.is_secure() && self.inner.tls.is_none() {
            return Err(NetError::InvalidArgument("tls scheme without a tls provider"));
        }

        let pool = self
            .inner
            .groups
            .entry(group.clone())
            .or_insert_with(|| {
                tracing::debug!(group = %group, "creating connection group");
                Pool::new(self.inner.config.clone(), self.connector_for(&group))
            })
            .clone();
        Ok(pool.acquire(context, 1))
    }

    fn connector_for(&self, group: &GroupId) -> EndpointConnector<T> {
        let tls = group.is_secure().then(|| {
            TlsRequest::new()
                .with_server_name(group.host.clone())
                .with_alpn(true)
        });
        EndpointConnector {
            transport: self.inner.transport.clone(),
            proxy: self.inner.proxy.clone(),
            tls_provider: self.inner.tls.clone(),
            remote: group.address(),
            tls,
            multiplex_limit: self.inner.multiplex_limit,
        }
    }

    pub fn group_count(&self) -> usize {
        self.inner.groups.len()
    }

    /// Statistics of the group serving `url`, if it exists.
    pub fn group_stats(&self, url: &Url) -> Option<PoolStats> {
        let group = GroupId::from_url(url).ok()?;
        self.inner.groups.get(&group).map(|pool| pool.stats())
    }

    /// Close idle connections past the idle timeout and drop groups left
    /// with neither connections nor waiters. Returns the number of
    /// connections closed.
    pub fn cleanup_idle_sockets(&self) -> usize {
        let mut closed = 0;
        let mut empty = Vec::new();
        for entry in self.inner.groups.iter() {
            closed += entry.value().cleanup_idle();
            let stats = entry.value().stats();
            if stats.connections == 0 && stats.waiters == 0 {
                empty.push(entry.key().clone());
            }
        }
        for group in empty {
            self.inner
                .groups
                .remove_if(&group, |_, pool| {
                    let stats = pool.stats();
                    stats.connections == 0 && stats.waiters == 0
                });
        }
        if closed > 0 {
            tracing::debug!(closed, groups = self.group_count(), "idle cleanup");
        }
        closed
    }

    /// Run [`cleanup_idle_sockets`](Self::cleanup_idle_sockets) every
    /// minute until the registry is dropped or closed.
    pub fn start_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let registry: Weak<Registry<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = registry.upgrade() else {
                    return;
                };
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                ClientSocketPool { inner }.cleanup_idle_sockets();
            }
        })
    }

    /// Close every group. Queued requests fail with
    /// [`NetError::PoolClosed`]; outstanding leases keep their connections
    /// until released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = self.inner.groups.iter().map(|e| e.value().clone()).collect();
        self.inner.groups.clear();
        for pool in pools {
            pool.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T: Transport> fmt::Debug for ClientSocketPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("groups", &self.inner.groups.len())
            .field("config", &self.inner.config)
            .field("proxy", &self.inner.proxy)
            .field("multiplex_limit", &self.inner.multiplex_limit)
            .finish()
    }
}

/// Opens connections to one endpoint through the establishment pipeline.
struct EndpointConnector<T: Transport> {
    transport: Arc<T>,
    proxy: Option<ProxyOptions>,
    tls_provider: Option<Arc<dyn TlsContextProvider<T::Channel>>>,
    remote: Address,
    tls: Option<TlsRequest>,
    multiplex_limit: u32,
}

impl<T: Transport> Connector<T::Channel> for EndpointConnector<T> {
    fn connect(&self, context: &Context) -> Deferred<Connected<T::Channel>> {
        let mut job = ConnectJob::new(self.transport.clone(), context).with_proxy(self.proxy.clone());
        if let Some(provider) = &self.tls_provider {
            job = job.with_tls(provider.clone());
        }
        let multiplex_limit = self.multiplex_limit;
        let established = job.connect(self.remote.clone(), self.tls.clone());
        established.map(move |connection| {
            let concurrency = match job.application_protocol().as_deref() {
                Some("h2") => multiplex_limit,
                _ => 1,
            };
            Connected {
                connection,
                concurrency,
            }
        })
    }

    fn close(&self, connection: T::Channel) {
        connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_default_ports() {
        let https = GroupId::from_url(&Url::parse("https://Example.com/a").unwrap()).unwrap();
        assert_eq!(https.to_string(), "https://example.com:443");
        assert!(https.is_secure());

        let ws = GroupId::from_url(&Url::parse("ws://example.com:8080").unwrap()).unwrap();
        assert_eq!(ws.address(), Address::inet("example.com", 8080));
        assert!(!ws.is_secure());
    }

    #[test]
    fn test_group_id_requires_host() {
        assert!(GroupId::from_url(&Url::parse("data:text/plain,hi").unwrap()).is_err());
    }
}
