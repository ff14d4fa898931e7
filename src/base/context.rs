//! Ergonomic error context helpers.
//!
//! Extension traits that turn bare IO errors into `NetError` variants
//! carrying the host, port or domain that was being contacted.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use relaynet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// // Error: "Connection to example.com:443 failed: connection refused"
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Classify an IO error raised mid-handshake as the given protocol
    /// error, keeping EOF, resets and timeouts distinguishable. The IO error
    /// stays attached as the source.
    fn handshake_context(self, protocol_error: NetError) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(host, port, e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }

    fn handshake_context(self, protocol_error: NetError) -> Result<T, NetError> {
        self.map_err(|e| {
            let error = match e.kind() {
                io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
                io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
                io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
                _ => protocol_error,
            };
            NetError::handshake_io(error, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_connection_context() {
        let result: Result<(), io::Error> =
            Err(Error::new(ErrorKind::ConnectionRefused, "refused"));
        let err = result.connection_context("example.com", 443).unwrap_err();

        match err {
            NetError::ConnectionFailedTo { host, port, .. } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            _ => panic!("Expected ConnectionFailedTo"),
        }
    }

    #[test]
    fn test_dns_context() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::NotFound, "no such host"));
        let err = result.dns_context("unknown.example.com").unwrap_err();

        match err {
            NetError::NameNotResolvedFor { domain, .. } => {
                assert_eq!(domain, "unknown.example.com");
            }
            _ => panic!("Expected NameNotResolvedFor"),
        }
    }

    #[test]
    fn test_handshake_context_keeps_eof() {
        let eof: Result<(), io::Error> = Err(Error::new(ErrorKind::UnexpectedEof, "eof"));
        match eof.handshake_context(NetError::SocksConnectionFailed).unwrap_err() {
            NetError::HandshakeIo { error, source } => {
                assert!(matches!(*error, NetError::ConnectionClosed));
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("Expected HandshakeIo, got {other}"),
        }

        let other: Result<(), io::Error> = Err(Error::new(ErrorKind::InvalidData, "garbage"));
        let err = other.handshake_context(NetError::SocksConnectionFailed).unwrap_err();
        assert!(matches!(err.root_cause(), NetError::SocksConnectionFailed));
        assert_eq!(err.as_i32(), NetError::SocksConnectionFailed.as_i32());
        assert!(err.to_string().contains("garbage"));
    }
}
