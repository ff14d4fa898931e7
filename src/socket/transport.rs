//! Transport collaborator of the establishment pipeline: address
//! resolution, channel factories and raw connects.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::{parse_ip_literal, GaiResolver, Name, Resolve};
use crate::future::{Context, Deferred};
use crate::socket::channel::{Channel, TcpChannel};
use crate::socket::client::SocketType;
use crate::socket::handshake::{HandshakeCompletion, HandshakeEvent, HandshakeHandler};
use crate::socket::proxy::{self, ProxyProtocol};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use url::{Host, Url};

/// A remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Host name or IP literal (no brackets) and port.
    Inet { host: String, port: u16 },
    DomainSocket(PathBuf),
}

impl Address {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Address::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn domain_socket(path: impl Into<PathBuf>) -> Self {
        Address::DomainSocket(path.into())
    }

    /// Endpoint of `url`, using the scheme's default port when none is given.
    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(NetError::InvalidUrl),
        };
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok(Address::Inet { host, port })
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Address::Inet { .. } => AddressFamily::Inet,
            Address::DomainSocket(_) => AddressFamily::DomainSocket,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Address::Inet { host, .. } => Some(host),
            Address::DomainSocket(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Inet { port, .. } => Some(*port),
            Address::DomainSocket(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Inet { host, port } => write!(f, "{host}:{port}"),
            Address::DomainSocket(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    DomainSocket,
}

/// How the destination is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressResolution {
    /// Resolved locally and dialled directly.
    #[default]
    Direct,
    /// The proxy is dialled; the destination name goes to the proxy.
    ProxyRelayed,
}

/// A resolved dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Socket(SocketAddr),
    DomainSocket(PathBuf),
}

/// Kind of raw channel a transport opens for an address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFactory {
    Tcp,
    DomainSocket,
}

impl ChannelFactory {
    pub fn accepts(&self, target: &ConnectTarget) -> bool {
        matches!(
            (self, target),
            (ChannelFactory::Tcp, ConnectTarget::Socket(_))
                | (ChannelFactory::DomainSocket, ConnectTarget::DomainSocket(_))
        )
    }
}

/// Everything the establishment pipeline needs from the network layer.
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;

    fn resolve_address(&self, context: &Context, host: &str) -> Deferred<IpAddr>;

    fn channel_factory(&self, family: AddressFamily) -> Result<ChannelFactory, NetError>;

    fn connect(
        &self,
        context: &Context,
        factory: &ChannelFactory,
        target: ConnectTarget,
    ) -> Deferred<Self::Channel>;

    /// Handler that tunnels to `destination` through the proxy at
    /// `proxy_address`, failing with [`NetError::ConnectionTimedOut`] after
    /// `timeout`.
    fn proxy_handler(
        &self,
        protocol: ProxyProtocol,
        proxy_address: Address,
        destination: Address,
        timeout: Duration,
    ) -> Box<dyn HandshakeHandler<Self::Channel>>;
}

/// [`Transport`] over tokio sockets.
#[derive(Clone)]
pub struct TokioTransport {
    resolver: Arc<dyn Resolve>,
    connect_timeout: Option<Duration>,
}

impl Default for TokioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioTransport {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(GaiResolver::new()),
            connect_timeout: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for TokioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTransport")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Transport for TokioTransport {
    type Channel = TcpChannel;

    fn resolve_address(&self, context: &Context, host: &str) -> Deferred<IpAddr> {
        if let Some(ip) = parse_ip_literal(host) {
            return Deferred::succeeded(context, ip);
        }
        let resolver = self.resolver.clone();
        let name = Name::new(host);
        Deferred::spawn(context, async move {
            let domain = name.to_string();
            let mut addrs = resolver.resolve(name).await?;
            addrs.next().ok_or_else(|| {
                NetError::dns_failed(&domain, io::Error::new(io::ErrorKind::NotFound, "empty answer"))
            })
        })
    }

    fn channel_factory(&self, family: AddressFamily) -> Result<ChannelFactory, NetError> {
        match family {
            AddressFamily::Inet => Ok(ChannelFactory::Tcp),
            #[cfg(unix)]
            AddressFamily::DomainSocket => Ok(ChannelFactory::DomainSocket),
            #[cfg(not(unix))]
            AddressFamily::DomainSocket => Err(NetError::AddressInvalid),
        }
    }

    fn connect(
        &self,
        context: &Context,
        factory: &ChannelFactory,
        target: ConnectTarget,
    ) -> Deferred<TcpChannel> {
        if !factory.accepts(&target) {
            return Deferred::failed(
                context,
                NetError::InvalidArgument("channel factory does not match target"),
            );
        }
        let connect_timeout = self.connect_timeout;
        Deferred::spawn(context, async move {
            let dial = open_socket(target);
            let socket = match connect_timeout {
                Some(limit) => tokio::time::timeout(limit, dial)
                    .await
                    .map_err(|_| NetError::ConnectionTimedOut)??,
                None => dial.await?,
            };
            let channel = TcpChannel::new(socket);
            tracing::debug!(channel = %channel.id(), peer = ?channel.peer_addr(), "channel connected");
            Ok(channel)
        })
    }

    fn proxy_handler(
        &self,
        protocol: ProxyProtocol,
        proxy_address: Address,
        destination: Address,
        timeout: Duration,
    ) -> Box<dyn HandshakeHandler<TcpChannel>> {
        Box::new(ProxyHandshakeHandler {
            protocol,
            proxy_address,
            destination,
            timeout,
        })
    }
}

async fn open_socket(target: ConnectTarget) -> Result<SocketType, NetError> {
    match target {
        ConnectTarget::Socket(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .connection_context(&addr.ip().to_string(), addr.port())?;
            stream.set_nodelay(true).connection_context(&addr.ip().to_string(), addr.port())?;
            Ok(SocketType::Tcp(stream))
        }
        #[cfg(unix)]
        ConnectTarget::DomainSocket(path) => {
            let stream = tokio::net::UnixStream::connect(&path)
                .await
                .connection_context(&path.display().to_string(), 0)?;
            Ok(SocketType::Unix(stream))
        }
        #[cfg(not(unix))]
        ConnectTarget::DomainSocket(_) => Err(NetError::AddressInvalid),
    }
}

/// Drives one proxy protocol over the raw socket of a [`TcpChannel`].
struct ProxyHandshakeHandler {
    protocol: ProxyProtocol,
    proxy_address: Address,
    destination: Address,
    timeout: Duration,
}

impl HandshakeHandler<TcpChannel> for ProxyHandshakeHandler {
    fn name(&self) -> &'static str {
        self.protocol.name()
    }

    fn handshake(&self, context: &Context, channel: &TcpChannel) -> Deferred<HandshakeEvent> {
        let completion = HandshakeCompletion::new(context, self.protocol.name());
        let protocol = self.protocol.clone();
        let destination = self.destination.clone();
        let channel = channel.clone();
        tracing::debug!(
            proxy = %self.proxy_address,
            destination = %destination,
            protocol = protocol.name(),
            "starting proxy handshake"
        );
        completion.drive(self.timeout, async move {
            let mut socket = channel.take_socket().await?;
            proxy::handshake(&mut socket, &protocol, &destination).await?;
            if !channel.put_socket(socket).await {
                return Err(NetError::ConnectionClosed);
            }
            Ok(HandshakeEvent::ProxyConnected { destination })
        });
        completion.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_url() {
        let url = Url::parse("https://example.com/path").unwrap();
        assert_eq!(Address::from_url(&url).unwrap(), Address::inet("example.com", 443));

        let url = Url::parse("http://[::1]:8080/").unwrap();
        let addr = Address::from_url(&url).unwrap();
        assert_eq!(addr.host(), Some("::1"));
        assert_eq!(addr.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_address_family() {
        assert_eq!(Address::inet("a", 1).family(), AddressFamily::Inet);
        let uds = Address::domain_socket("/tmp/x.sock");
        assert_eq!(uds.family(), AddressFamily::DomainSocket);
        assert_eq!(uds.host(), None);
        assert_eq!(uds.port(), None);
    }

    #[test]
    fn test_factory_accepts_matching_target() {
        let tcp = ConnectTarget::Socket("127.0.0.1:80".parse().unwrap());
        assert!(ChannelFactory::Tcp.accepts(&tcp));
        assert!(!ChannelFactory::DomainSocket.accepts(&tcp));
    }

    #[tokio::test]
    async fn test_resolve_literal_is_immediate() {
        let transport = TokioTransport::new();
        let resolved = transport.resolve_address(&Context::serial(), "127.0.0.1");
        assert_eq!(resolved.outcome().unwrap().unwrap(), IpAddr::from([127, 0, 0, 1]));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TokioTransport::new();
        let outcome = transport
            .connect(&Context::serial(), &ChannelFactory::Tcp, ConnectTarget::Socket(addr))
            .await;
        assert!(outcome.unwrap_err().is_connect_failure());
    }
}
