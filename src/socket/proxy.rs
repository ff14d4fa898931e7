//! Proxy configuration and wire handshakes.
//!
//! [`ProxyOptions`] is resolved once into a [`ProxyProtocol`], a closed set
//! of variants each carrying exactly the credentials its protocol can send
//! (SOCKS4 has no password field). [`handshake`] drives the chosen protocol
//! over any async byte stream until the tunnel to the destination is open.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::transport::Address;
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;
use zeroize::Zeroizing;

/// Longest HTTP CONNECT response head we accept.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// HTTP proxy tunnelling with CONNECT.
    Http,
    /// SOCKS4, or SOCKS4a when the destination is a hostname.
    Socks4,
    Socks5,
}

impl ProxyType {
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyType::Http => 80,
            ProxyType::Socks4 | ProxyType::Socks5 => 1080,
        }
    }
}

/// Proxy configuration.
#[derive(Clone)]
pub struct ProxyOptions {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    /// Zeroized on drop.
    pub password: Option<Zeroizing<String>>,
    /// Bound on the proxy handshake.
    pub connect_timeout: Duration,
}

impl ProxyOptions {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            host: host.into(),
            port,
            username: None,
            password: None,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Parse `http://`, `socks4://`, `socks4a://`, `socks5://` or
    /// `socks5h://` URLs, with optional `user:pass@` credentials.
    pub fn from_url(url_str: &str) -> Result<Self, NetError> {
        let url = Url::parse(url_str).map_err(|_| NetError::InvalidUrl)?;
        let proxy_type = match url.scheme() {
            "http" => ProxyType::Http,
            "socks4" | "socks4a" => ProxyType::Socks4,
            "socks5" | "socks5h" => ProxyType::Socks5,
            _ => return Err(NetError::InvalidUrl),
        };
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port().unwrap_or(proxy_type.default_port());
        let mut options = Self::new(proxy_type, host, port);
        if !url.username().is_empty() {
            options.username = Some(url.username().to_string());
        }
        options.password = url.password().map(|p| Zeroizing::new(p.to_string()));
        Ok(options)
    }

    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `Proxy-Authorization` value for HTTP proxies.
    pub fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                let creds = Zeroizing::new(format!("{}:{}", u, p.as_str()));
                Some(format!("Basic {}", general_purpose::STANDARD.encode(creds.as_bytes())))
            }
            _ => None,
        }
    }

    pub fn address(&self) -> Address {
        Address::inet(self.host.clone(), self.port)
    }

    /// Select the protocol variant and the credentials it carries.
    pub fn protocol(&self) -> ProxyProtocol {
        match self.proxy_type {
            ProxyType::Http => ProxyProtocol::Http {
                authorization: self.auth_header().map(Zeroizing::new),
            },
            ProxyType::Socks4 => ProxyProtocol::Socks4 {
                username: self.username.clone(),
            },
            ProxyType::Socks5 => ProxyProtocol::Socks5 {
                credentials: match (&self.username, &self.password) {
                    (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                    _ => None,
                },
            },
        }
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("proxy_type", &self.proxy_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// A proxy protocol with the credentials it is able to send.
#[derive(Clone)]
pub enum ProxyProtocol {
    Http {
        authorization: Option<Zeroizing<String>>,
    },
    Socks4 {
        username: Option<String>,
    },
    Socks5 {
        credentials: Option<(String, Zeroizing<String>)>,
    },
}

impl ProxyProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyProtocol::Http { .. } => "http-connect",
            ProxyProtocol::Socks4 { .. } => "socks4",
            ProxyProtocol::Socks5 { .. } => "socks5",
        }
    }
}

impl fmt::Debug for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Http { authorization } => f
                .debug_struct("Http")
                .field("authorization", &authorization.is_some())
                .finish(),
            ProxyProtocol::Socks4 { username } => {
                f.debug_struct("Socks4").field("username", username).finish()
            }
            ProxyProtocol::Socks5 { credentials } => f
                .debug_struct("Socks5")
                .field("username", &credentials.as_ref().map(|(u, _)| u))
                .finish(),
        }
    }
}

/// Open a tunnel to `destination` through the proxy at the other end of
/// `stream`.
pub async fn handshake<S>(
    stream: &mut S,
    protocol: &ProxyProtocol,
    destination: &Address,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = match destination {
        Address::Inet { host, port } => (host.as_str(), *port),
        Address::DomainSocket(_) => return Err(NetError::AddressInvalid),
    };
    tracing::debug!(protocol = protocol.name(), host = %host, port, "proxy handshake");
    match protocol {
        ProxyProtocol::Http { authorization } => {
            http_connect(stream, host, port, authorization.as_ref().map(|a| a.as_str())).await
        }
        ProxyProtocol::Socks4 { username } => {
            socks4_connect(stream, host, port, username.as_deref()).await
        }
        ProxyProtocol::Socks5 { credentials } => {
            let creds = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
            socks5_connect(stream, host, port, creds).await
        }
    }
}

pub fn encode_http_connect(host: &str, port: u16, authorization: Option<&str>) -> BytesMut {
    let authority = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    };
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").as_bytes());
    if let Some(auth) = authorization {
        buf.put_slice(b"Proxy-Authorization: ");
        buf.put_slice(auth.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// Map the status line of a CONNECT response.
pub fn parse_http_connect_status(head: &[u8]) -> Result<(), NetError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| NetError::TunnelConnectionFailed)?;
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(NetError::TunnelConnectionFailed);
    }
    match parts.next().and_then(|code| code.parse::<u16>().ok()) {
        Some(200) => Ok(()),
        Some(407) => Err(NetError::ProxyAuthRequested),
        Some(code) => {
            tracing::debug!(code, "proxy refused CONNECT");
            Err(NetError::TunnelConnectionFailed)
        }
        None => Err(NetError::TunnelConnectionFailed),
    }
}

async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    authorization: Option<&str>,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_http_connect(host, port, authorization);
    stream
        .write_all(&request)
        .await
        .handshake_context(NetError::TunnelConnectionFailed)?;
    stream
        .flush()
        .await
        .handshake_context(NetError::TunnelConnectionFailed)?;

    // Read byte by byte so nothing past the response head is consumed.
    let mut head = BytesMut::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(NetError::TunnelConnectionFailed);
        }
        stream
            .read_exact(&mut byte)
            .await
            .handshake_context(NetError::TunnelConnectionFailed)?;
        head.put_u8(byte[0]);
    }
    parse_http_connect_status(&head)
}

pub fn encode_socks4_connect(host: &str, port: u16, username: Option<&str>) -> Result<BytesMut, NetError> {
    let mut buf = BytesMut::with_capacity(16 + host.len());
    buf.put_u8(0x04);
    buf.put_u8(0x01);
    buf.put_u16(port);
    let hostname = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_slice(&ip.octets());
            None
        }
        Ok(IpAddr::V6(_)) => return Err(NetError::AddressInvalid),
        Err(_) => {
            // SOCKS4a: 0.0.0.x tells the proxy a hostname follows.
            buf.put_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
            Some(host)
        }
    };
    buf.put_slice(username.unwrap_or_default().as_bytes());
    buf.put_u8(0x00);
    if let Some(hostname) = hostname {
        buf.put_slice(hostname.as_bytes());
        buf.put_u8(0x00);
    }
    Ok(buf)
}

async fn socks4_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_socks4_connect(host, port, username)?;
    stream
        .write_all(&request)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;
    match reply[1] {
        0x5A => Ok(()),
        code => {
            tracing::debug!(code, "SOCKS4 request rejected");
            Err(NetError::SocksConnectionFailed)
        }
    }
}

pub fn encode_socks5_connect(host: &str, port: u16) -> Result<BytesMut, NetError> {
    let mut buf = BytesMut::with_capacity(7 + host.len());
    buf.put_slice(&[0x05, 0x01, 0x00]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(0x01);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(0x04);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| NetError::AddressInvalid)?;
            buf.put_u8(0x03);
            buf.put_u8(len);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(buf)
}

async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;
    if choice[0] != 0x05 {
        return Err(NetError::SocksConnectionFailed);
    }
    match (choice[1], credentials) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => socks5_authenticate(stream, user, pass).await?,
        (method, _) => {
            tracing::debug!(method, "no acceptable SOCKS5 auth method");
            return Err(NetError::SocksConnectionFailed);
        }
    }

    let request = encode_socks5_connect(host, port)?;
    stream
        .write_all(&request)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;
    if reply[0] != 0x05 {
        return Err(NetError::SocksConnectionFailed);
    }
    match reply[1] {
        0x00 => {}
        0x03 | 0x04 => return Err(NetError::SocksConnectionHostUnreachable),
        code => {
            tracing::debug!(code, "SOCKS5 request rejected");
            return Err(NetError::SocksConnectionFailed);
        }
    }

    // Skip the bound address and port.
    let bound = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .handshake_context(NetError::SocksConnectionFailed)?;
            usize::from(len[0])
        }
        _ => return Err(NetError::SocksConnectionFailed),
    };
    let mut rest = vec![0u8; bound + 2];
    stream
        .read_exact(&mut rest)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;
    Ok(())
}

/// RFC 1929 username/password sub-negotiation.
async fn socks5_authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(user.len()).map_err(|_| NetError::InvalidArgument("SOCKS5 username too long"))?;
    let plen = u8::try_from(pass.len()).map_err(|_| NetError::InvalidArgument("SOCKS5 password too long"))?;
    let mut buf = Zeroizing::new(Vec::with_capacity(3 + user.len() + pass.len()));
    buf.push(0x01);
    buf.push(ulen);
    buf.extend_from_slice(user.as_bytes());
    buf.push(plen);
    buf.extend_from_slice(pass.as_bytes());
    stream
        .write_all(&buf)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;

    let mut status = [0u8; 2];
    stream
        .read_exact(&mut status)
        .await
        .handshake_context(NetError::SocksConnectionFailed)?;
    if status[1] != 0x00 {
        tracing::debug!("SOCKS5 authentication rejected");
        return Err(NetError::SocksConnectionFailed);
    }
    Ok(())
}
