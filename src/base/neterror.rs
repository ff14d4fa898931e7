use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the pooling and connection-establishment core.
///
/// Errors travel as values through [`Deferred`](crate::future::Deferred)
/// results, so the type is `Clone`; IO causes are shared behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        source: Arc<io::Error>,
    },
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,

    // Resolution Errors
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name not resolved for {domain}: {source}")]
    NameNotResolvedFor {
        domain: String,
        source: Arc<io::Error>,
    },

    // Proxy Errors
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Proxy auth requested")]
    ProxyAuthRequested,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("SOCKS connection failed")]
    SocksConnectionFailed,
    #[error("SOCKS connection host unreachable")]
    SocksConnectionHostUnreachable,
    #[error("Proxy handshake failed: {source}")]
    ProxyHandshakeFailed { source: Arc<NetError> },

    /// IO failure in the middle of a handshake, classified as `error`.
    #[error("{error}: {source}")]
    HandshakeIo {
        error: Arc<NetError>,
        source: Arc<io::Error>,
    },

    // TLS Errors
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("SSL error: {message}")]
    SslError { message: String },
    #[error("Failed to create SSL connection: {source}")]
    SslHandshakeFailed { source: Arc<NetError> },
    #[error("ALPN negotiation failed")]
    AlpnNegotiationFailed,

    // Pool Errors
    #[error("Wait queue is full ({max} waiters)")]
    WaitQueueFull { max: usize },
    #[error("Pool closed")]
    PoolClosed,

    // Contract Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Callback panicked: {message}")]
    CallbackPanicked { message: String },

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// IO failure while connecting to `host:port`.
    pub fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }

    /// IO failure while resolving `domain`.
    pub fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }

    /// Wrap the cause of a failed TLS handshake.
    pub fn ssl_handshake(cause: NetError) -> Self {
        NetError::SslHandshakeFailed {
            source: Arc::new(cause),
        }
    }

    /// Wrap the cause of a failed proxy handshake.
    pub fn proxy_handshake(cause: NetError) -> Self {
        NetError::ProxyHandshakeFailed {
            source: Arc::new(cause),
        }
    }

    /// Handshake IO failure classified as `error`, keeping the IO cause.
    pub fn handshake_io(error: NetError, source: io::Error) -> Self {
        NetError::HandshakeIo {
            error: Arc::new(error),
            source: Arc::new(source),
        }
    }

    /// Innermost classified error, looking through handshake wrappers.
    pub fn root_cause(&self) -> &NetError {
        match self {
            NetError::SslHandshakeFailed { source } | NetError::ProxyHandshakeFailed { source } => {
                source.root_cause()
            }
            NetError::HandshakeIo { error, .. } => error.root_cause(),
            other => other,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::SslProtocolError | NetError::SslError { .. } => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::TunnelConnectionFailed => -111,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::SocksConnectionFailed => -120,
            NetError::SocksConnectionHostUnreachable => -121,
            NetError::AlpnNegotiationFailed => -122,
            NetError::ProxyAuthRequested => -127,
            NetError::ProxyConnectionFailed => -130,
            NetError::SslHandshakeFailed { .. } => -148,
            NetError::ProxyHandshakeFailed { .. } => -130,
            NetError::HandshakeIo { error, .. } => error.as_i32(),
            NetError::InvalidUrl => -300,
            // Crate-specific codes stay clear of Chromium's ranges.
            NetError::WaitQueueFull { .. } => -10000,
            NetError::PoolClosed => -10001,
            NetError::InvalidArgument(_) => -10002,
            NetError::CallbackPanicked { .. } => -10003,
            NetError::Unknown(code) => *code,
        }
    }

    /// True for failures raised before any byte reached the peer, where a
    /// fresh attempt may succeed.
    pub fn is_connect_failure(&self) -> bool {
        if let NetError::HandshakeIo { error, .. } = self {
            return error.is_connect_failure();
        }
        matches!(
            self,
            NetError::ConnectionRefused
                | NetError::ConnectionReset
                | NetError::ConnectionFailed
                | NetError::ConnectionFailedTo { .. }
                | NetError::ConnectionTimedOut
                | NetError::AddressUnreachable
        )
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -111 => NetError::TunnelConnectionFailed,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -120 => NetError::SocksConnectionFailed,
            -121 => NetError::SocksConnectionHostUnreachable,
            -122 => NetError::AlpnNegotiationFailed,
            -127 => NetError::ProxyAuthRequested,
            -130 => NetError::ProxyConnectionFailed,
            -300 => NetError::InvalidUrl,
            -10001 => NetError::PoolClosed,
            _ => NetError::Unknown(code),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::NotConnected => NetError::SocketNotConnected,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => NetError::ConnectionClosed,
            io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            _ => NetError::ConnectionFailed,
        }
    }
}
