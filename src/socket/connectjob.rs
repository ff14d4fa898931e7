//! Establishment pipeline: resolve, connect, proxy handshake, TLS
//! handshake, connected.
//!
//! A [`ConnectJob`] runs each stage as a step in a chain of deferred
//! results, so a stage that fails skips every later stage. Once a raw
//! channel exists, any failure closes it before the failure reaches the
//! caller.

use crate::base::neterror::NetError;
use crate::future::context::{catch_panic, lock};
use crate::future::{Context, Deferred};
use crate::socket::channel::Channel;
use crate::socket::handshake::HandshakeEvent;
use crate::socket::proxy::ProxyOptions;
use crate::socket::tls::TlsContextProvider;
use crate::socket::transport::{Address, AddressResolution, ChannelFactory, ConnectTarget, Transport};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Progress of one establishment attempt.
#[derive(Debug, Clone)]
pub enum EstablishmentState {
    Init,
    ProxyHandshake,
    TlsHandshake,
    Connected,
    Failed(NetError),
}

impl EstablishmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EstablishmentState::Connected | EstablishmentState::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            EstablishmentState::Init => 0,
            EstablishmentState::ProxyHandshake => 1,
            EstablishmentState::TlsHandshake => 2,
            EstablishmentState::Connected | EstablishmentState::Failed(_) => 3,
        }
    }
}

/// TLS parameters of one connection.
#[derive(Debug, Clone)]
pub struct TlsRequest {
    /// SNI name; defaults to the peer host.
    pub server_name: Option<String>,
    /// Logical peer of the TLS session when it differs from the dialled
    /// address; defaults to the remote address.
    pub peer: Option<Address>,
    pub use_alpn: bool,
    pub handshake_timeout: Duration,
}

impl TlsRequest {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self {
            server_name: None,
            peer: None,
            use_alpn: false,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_peer(mut self, peer: Address) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_alpn(mut self, use_alpn: bool) -> Self {
        self.use_alpn = use_alpn;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for TlsRequest {
    fn default() -> Self {
        Self::new()
    }
}

type ReadyHandler<C> = Box<dyn FnOnce(&C) + Send>;

struct Tracker<C> {
    state: EstablishmentState,
    started: bool,
    resolution: AddressResolution,
    channel: Option<C>,
    application_protocol: Option<String>,
}

struct Progress<C> {
    tracker: Mutex<Tracker<C>>,
    ready: Mutex<Option<ReadyHandler<C>>>,
}

impl<C: Channel> Progress<C> {
    fn advance(&self, next: EstablishmentState) {
        let mut tracker = lock(&self.tracker);
        assert!(
            !tracker.state.is_terminal() && next.rank() > tracker.state.rank(),
            "illegal establishment transition {:?} -> {:?}",
            tracker.state,
            next
        );
        tracing::trace!(from = ?tracker.state, to = ?next, "establishment stage");
        tracker.state = next;
    }

    fn attach(&self, channel: &C) {
        lock(&self.tracker).channel = Some(channel.clone());
    }

    fn fail(&self, error: &NetError) {
        let channel = {
            let mut tracker = lock(&self.tracker);
            assert!(
                !tracker.state.is_terminal(),
                "establishment failed after {:?}",
                tracker.state
            );
            tracker.state = EstablishmentState::Failed(error.clone());
            tracker.channel.take()
        };
        tracing::debug!(error = %error, "connection establishment failed");
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

/// One connection attempt through the establishment pipeline.
///
/// A job is single-use: the second call to [`connect`](Self::connect)
/// fails with [`NetError::InvalidArgument`].
pub struct ConnectJob<T: Transport> {
    transport: Arc<T>,
    context: Context,
    proxy: Option<ProxyOptions>,
    tls: Option<Arc<dyn TlsContextProvider<T::Channel>>>,
    progress: Arc<Progress<T::Channel>>,
}

impl<T: Transport> ConnectJob<T> {
    pub fn new(transport: Arc<T>, context: &Context) -> Self {
        Self {
            transport,
            context: context.clone(),
            proxy: None,
            tls: None,
            progress: Arc::new(Progress {
                tracker: Mutex::new(Tracker {
                    state: EstablishmentState::Init,
                    started: false,
                    resolution: AddressResolution::Direct,
                    channel: None,
                    application_protocol: None,
                }),
                ready: Mutex::new(None),
            }),
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyOptions>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_tls(mut self, provider: Arc<dyn TlsContextProvider<T::Channel>>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Callback run exactly once with the channel when establishment
    /// succeeds, before the result settles.
    pub fn handler<F>(self, callback: F) -> Self
    where
        F: FnOnce(&T::Channel) + Send + 'static,
    {
        *lock(&self.progress.ready) = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> EstablishmentState {
        lock(&self.progress.tracker).state.clone()
    }

    /// ALPN protocol negotiated by the TLS stage.
    pub fn application_protocol(&self) -> Option<String> {
        lock(&self.progress.tracker).application_protocol.clone()
    }

    pub fn resolution(&self) -> AddressResolution {
        lock(&self.progress.tracker).resolution
    }

    /// Establish a channel to `remote`, with a TLS handshake when `tls` is
    /// given.
    pub fn connect(&self, remote: Address, tls: Option<TlsRequest>) -> Deferred<T::Channel> {
        {
            let mut tracker = lock(&self.progress.tracker);
            if tracker.started {
                return Deferred::failed(
                    &self.context,
                    NetError::InvalidArgument("connect job already started"),
                );
            }
            tracker.started = true;
            tracker.resolution = if self.proxy.is_some() {
                AddressResolution::ProxyRelayed
            } else {
                AddressResolution::Direct
            };
        }

        tracing::debug!(
            remote = %remote,
            proxy = ?self.proxy.as_ref().map(|p| p.address().to_string()),
            tls = tls.is_some(),
            "starting connection establishment"
        );

        let progress = self.progress.clone();
        let attempt = match self.prepare(&remote, tls.as_ref()) {
            Ok(factory) => self.establish(factory, remote, tls),
            Err(e) => Deferred::failed(&self.context, e),
        };
        attempt.map_failure(move |e| {
            progress.fail(&e);
            Err(e)
        })
    }

    fn prepare(&self, remote: &Address, tls: Option<&TlsRequest>) -> Result<ChannelFactory, NetError> {
        let factory = self.transport.channel_factory(remote.family())?;
        if self.proxy.is_some() && matches!(remote, Address::DomainSocket(_)) {
            return Err(NetError::AddressInvalid);
        }
        if tls.is_some() && self.tls.is_none() {
            return Err(NetError::InvalidArgument("tls requested without a provider"));
        }
        Ok(factory)
    }

    fn establish(
        &self,
        factory: ChannelFactory,
        remote: Address,
        tls: Option<TlsRequest>,
    ) -> Deferred<T::Channel> {
        let dial = match &self.proxy {
            Some(proxy) => proxy.address(),
            None => remote.clone(),
        };

        let transport = self.transport.clone();
        let context = self.context.clone();
        let progress = self.progress.clone();
        let mut channel = self.resolve(&dial).flat_map(move |target| {
            transport
                .connect(&context, &factory, target)
                .map(move |channel| {
                    progress.attach(&channel);
                    channel
                })
        });

        if let Some(proxy) = self.proxy.clone() {
            channel = self.proxy_stage(channel, proxy, remote.clone());
        }
        if let Some(request) = tls {
            channel = self.tls_stage(channel, remote, request);
        }

        let progress = self.progress.clone();
        channel.try_map(move |channel| {
            let ready = lock(&progress.ready).take();
            if let Some(ready) = ready {
                catch_panic(|| ready(&channel))?;
            }
            progress.advance(EstablishmentState::Connected);
            tracing::debug!(channel = %channel.id(), "connection established");
            Ok(channel)
        })
    }

    fn resolve(&self, dial: &Address) -> Deferred<ConnectTarget> {
        match dial {
            Address::Inet { host, port } => {
                let port = *port;
                self.transport
                    .resolve_address(&self.context, host)
                    .map(move |ip| ConnectTarget::Socket(SocketAddr::new(ip, port)))
            }
            Address::DomainSocket(path) => {
                Deferred::succeeded(&self.context, ConnectTarget::DomainSocket(path.clone()))
            }
        }
    }

    fn proxy_stage(
        &self,
        channel: Deferred<T::Channel>,
        proxy: ProxyOptions,
        destination: Address,
    ) -> Deferred<T::Channel> {
        let transport = self.transport.clone();
        let context = self.context.clone();
        let progress = self.progress.clone();
        channel.flat_map(move |channel| {
            progress.advance(EstablishmentState::ProxyHandshake);
            let handler = transport.proxy_handler(
                proxy.protocol(),
                proxy.address(),
                destination,
                proxy.connect_timeout,
            );
            let name = handler.name();
            channel.pipeline().add_first(name);
            let failed_on = context.clone();
            handler.handshake(&context, &channel).compose(
                move |event| {
                    channel.pipeline().remove(name);
                    tracing::debug!(channel = %channel.id(), ?event, "proxy tunnel established");
                    Deferred::succeeded(&context, channel)
                },
                move |e| Deferred::failed(&failed_on, NetError::proxy_handshake(e)),
            )
        })
    }

    fn tls_stage(
        &self,
        channel: Deferred<T::Channel>,
        remote: Address,
        request: TlsRequest,
    ) -> Deferred<T::Channel> {
        let provider = self.tls.clone();
        let context = self.context.clone();
        let progress = self.progress.clone();
        channel.flat_map(move |channel| {
            progress.advance(EstablishmentState::TlsHandshake);
            let peer = request.peer.clone().unwrap_or(remote);
            let handler = provider
                .ok_or(NetError::InvalidArgument("tls requested without a provider"))
                .and_then(|provider| {
                    provider.create_client_handshake_handler(
                        &peer,
                        request.server_name.as_deref(),
                        request.use_alpn,
                        request.handshake_timeout,
                    )
                });
            let handler = match handler {
                Ok(handler) => handler,
                Err(e) => return Deferred::failed(&context, NetError::ssl_handshake(e)),
            };
            let name = handler.name();
            channel.pipeline().add_last(name);
            let failed_on = context.clone();
            handler.handshake(&context, &channel).compose(
                move |event| {
                    channel.pipeline().remove(name);
                    if let HandshakeEvent::TlsCompleted {
                        application_protocol,
                    } = event
                    {
                        lock(&progress.tracker).application_protocol = application_protocol;
                    }
                    Deferred::succeeded(&failed_on, channel)
                },
                move |e| Deferred::failed(&context, NetError::ssl_handshake(e)),
            )
        })
    }
}

impl<T: Transport> fmt::Debug for ConnectJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectJob")
            .field("state", &self.state())
            .field("proxy", &self.proxy)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
