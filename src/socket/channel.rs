//! Raw channels and their handler chains.

use crate::base::neterror::NetError;
use crate::future::context::lock;
use crate::socket::client::SocketType;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered names of the handlers currently installed on a channel.
///
/// Handshake stages install themselves while they own the byte stream and
/// remove themselves once done, so application data never passes through a
/// finished handshake.
#[derive(Default)]
pub struct HandlerChain {
    names: Mutex<VecDeque<&'static str>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_first(&self, name: &'static str) {
        lock(&self.names).push_front(name);
    }

    pub fn add_last(&self, name: &'static str) {
        lock(&self.names).push_back(name);
    }

    /// Remove the first handler called `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut names = lock(&self.names);
        match names.iter().position(|n| *n == name) {
            Some(at) => {
                names.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.names).iter().any(|n| *n == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.names).iter().copied().collect()
    }

    pub fn first(&self) -> Option<&'static str> {
        lock(&self.names).front().copied()
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A connected transport channel. Clones refer to the same channel.
pub trait Channel: Clone + Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn pipeline(&self) -> &HandlerChain;

    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// A tokio socket wrapped as a [`Channel`].
///
/// Handshake stages take the socket out, drive it, and put the (possibly
/// wrapped) socket back. A socket handed back after `close` is dropped.
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    peer: Option<SocketAddr>,
    socket: tokio::sync::Mutex<Option<SocketType>>,
    open: AtomicBool,
    pipeline: HandlerChain,
}

impl TcpChannel {
    pub fn new(socket: SocketType) -> Self {
        let peer = socket.peer_addr();
        Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId::next(),
                peer,
                socket: tokio::sync::Mutex::new(Some(socket)),
                open: AtomicBool::new(true),
                pipeline: HandlerChain::new(),
            }),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Take exclusive ownership of the socket.
    pub async fn take_socket(&self) -> Result<SocketType, NetError> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(NetError::SocketNotConnected);
        }
        self.inner
            .socket
            .lock()
            .await
            .take()
            .ok_or(NetError::SocketNotConnected)
    }

    /// Hand the socket back. Returns `false` (and drops it) if the channel
    /// was closed meanwhile.
    pub async fn put_socket(&self, socket: SocketType) -> bool {
        let mut slot = self.inner.socket.lock().await;
        if !self.inner.open.load(Ordering::Acquire) {
            tracing::trace!(channel = %self.inner.id, "dropping socket returned to closed channel");
            return false;
        }
        *slot = Some(socket);
        true
    }

    /// True when the socket is present and passes the liveness probe.
    pub fn is_connected(&self) -> bool {
        if !self.inner.open.load(Ordering::Acquire) {
            return false;
        }
        match self.inner.socket.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(|s| s.is_connected()),
            // Someone is using it.
            Err(_) => true,
        }
    }

    pub fn is_tls(&self) -> bool {
        match self.inner.socket.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(|s| s.is_tls()),
            Err(_) => false,
        }
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.inner.id
    }

    fn pipeline(&self) -> &HandlerChain {
        &self.inner.pipeline
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(channel = %self.inner.id, "closing channel");
        // A stage holding the socket drops it when it tries to put it back.
        if let Ok(mut slot) = self.inner.socket.try_lock() {
            slot.take();
        }
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("open", &self.is_open())
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_chain_order() {
        let chain = HandlerChain::new();
        chain.add_last("tls");
        chain.add_first("proxy");
        assert_eq!(chain.names(), vec!["proxy", "tls"]);
        assert_eq!(chain.first(), Some("proxy"));

        assert!(chain.remove("proxy"));
        assert!(!chain.remove("proxy"));
        assert_eq!(chain.names(), vec!["tls"]);
        assert!(chain.contains("tls"));
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_close_drops_returned_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) =
            tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());

        let channel = TcpChannel::new(SocketType::Tcp(client.unwrap()));
        assert_eq!(channel.peer_addr(), Some(addr));

        let socket = channel.take_socket().await.unwrap();
        channel.close();
        assert!(!channel.put_socket(socket).await);
        assert!(channel.take_socket().await.is_err());
        assert!(!channel.is_connected());
    }
}
