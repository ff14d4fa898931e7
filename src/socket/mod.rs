//! Channels and connection establishment.
//!
//! - [`transport`]: addresses, the [`Transport`](transport::Transport) seam and its tokio implementation
//! - [`connectjob`]: resolve → proxy handshake → TLS → connected
//! - [`proxy`]: HTTP CONNECT, SOCKS4/4a and SOCKS5 handshakes
//! - [`tls`]: TLS configuration and the BoringSSL handshake handler
//! - [`pool`]: per-endpoint pools keyed by scheme, host and port

pub mod channel;
pub mod client;
pub mod connectjob;
pub mod handshake;
pub mod pool;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use channel::{Channel, ChannelId, HandlerChain, TcpChannel};
pub use connectjob::{ConnectJob, EstablishmentState, TlsRequest};
pub use handshake::{HandshakeCompletion, HandshakeEvent, HandshakeHandler};
pub use pool::{ClientSocketPool, ClientSocketPoolBuilder, GroupId};
pub use proxy::{ProxyOptions, ProxyProtocol, ProxyType};
pub use tls::{BoringTlsProvider, TlsConfig, TlsContextProvider};
pub use transport::{
    Address, AddressFamily, AddressResolution, ChannelFactory, ConnectTarget, TokioTransport,
    Transport,
};
