use crate::base::neterror::NetError;
use std::{collections::HashMap, fmt, future::Future, io, net::IpAddr, pin::Pin, sync::Arc};

/// A host name to resolve.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Resolved addresses, in the order the resolver prefers them.
pub type Addrs = Box<dyn Iterator<Item = IpAddr> + Send>;

pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Turns host names into IP addresses.
///
/// A successful resolution yields at least one address; an empty answer is
/// reported as [`NetError::NameNotResolvedFor`].
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Answers configured names from a table, everything else from `fallback`.
///
/// Without a fallback, unknown names fail with
/// [`NetError::NameNotResolvedFor`].
#[derive(Clone, Default)]
pub struct StaticResolver {
    entries: Arc<HashMap<String, Vec<IpAddr>>>,
    fallback: Option<Arc<dyn Resolve>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<dyn Resolve>) -> Self {
        Self {
            entries: Arc::default(),
            fallback: Some(fallback),
        }
    }

    /// Map `host` (case-insensitively) to `addrs`.
    pub fn insert(mut self, host: &str, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Arc::make_mut(&mut self.entries)
            .insert(host.to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.entries.get(&name.as_str().to_ascii_lowercase()) {
            if !addrs.is_empty() {
                let addrs: Addrs = Box::new(addrs.clone().into_iter());
                return Box::pin(std::future::ready(Ok(addrs)));
            }
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(name),
            None => Box::pin(std::future::ready(Err(NetError::dns_failed(
                name.as_str(),
                io::Error::new(io::ErrorKind::NotFound, "no static entry"),
            )))),
        }
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("entries", &self.entries.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
