use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_boring::SslStream;

/// A connected byte stream: plain TCP, a Unix domain socket, or TLS over
/// either.
pub enum SocketType {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<SslStream<SocketType>>),
}

impl SocketType {
    /// Lightweight liveness probe: a peer address must exist and a
    /// non-blocking read must not report EOF or an error.
    pub fn is_connected(&self) -> bool {
        match self {
            SocketType::Tcp(s) => {
                if s.peer_addr().is_err() {
                    return false;
                }
                let mut buf = [0u8; 1];
                match s.try_read(&mut buf) {
                    Ok(0) => false,
                    Ok(_) => true,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
            #[cfg(unix)]
            SocketType::Unix(s) => {
                let mut buf = [0u8; 1];
                match s.try_read(&mut buf) {
                    Ok(0) => false,
                    Ok(_) => true,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
            SocketType::Tls(s) => s.get_ref().is_connected(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SocketType::Tls(_))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketType::Tcp(s) => s.peer_addr().ok(),
            #[cfg(unix)]
            SocketType::Unix(_) => None,
            SocketType::Tls(s) => s.get_ref().peer_addr(),
        }
    }

    /// ALPN protocol negotiated on the outermost TLS layer.
    pub fn application_protocol(&self) -> Option<String> {
        match self {
            SocketType::Tls(s) => s
                .ssl()
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            _ => None,
        }
    }
}

impl fmt::Debug for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Tcp(s) => f.debug_tuple("Tcp").field(&s.peer_addr().ok()).finish(),
            #[cfg(unix)]
            SocketType::Unix(_) => f.write_str("Unix"),
            SocketType::Tls(s) => f.debug_tuple("Tls").field(s.get_ref()).finish(),
        }
    }
}

impl AsyncRead for SocketType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_read(cx, buf),
            SocketType::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketType {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_write(cx, buf),
            SocketType::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_flush(cx),
            SocketType::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            SocketType::Unix(s) => Pin::new(s).poll_shutdown(cx),
            SocketType::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
