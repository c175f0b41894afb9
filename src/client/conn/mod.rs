//! Connection-facing types: addresses, routes, the pool, and the
//! collaborator traits the engine dials and frames through.
//!
//! The split of concerns mirrors the rest of the crate: a [`SocketFactory`]
//! establishes a raw byte stream, a [`TlsFactory`] optionally upgrades it, a
//! [`CodecFactory`] takes ownership of the stream and frames HTTP over it,
//! and [`Connection`]/[`pool::ConnectionPool`] manage the lifecycle of the
//! result. None of the byte-level framing lives in this crate.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
pub mod connection;
pub mod dns;
pub(crate) mod exchange;
pub(crate) mod finder;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod pool;
pub mod route;
pub(crate) mod weakopt;

pub use self::codec::{Codec, CodecHost};
pub use self::connection::Connection;
pub use self::dns::{Dns, GaiResolver};
pub use self::pool::ConnectionPool;
pub use self::route::Route;

use crate::error::Error;

/// A bidirectional byte stream a connection can be built over.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`Socket`].
pub type BoxedSocket = Box<dyn Socket>;

/// The application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    /// HTTP/1.1: one exchange at a time per connection.
    Http1,

    /// HTTP/2: concurrent streams multiplexed over one connection.
    Http2,
}

impl HttpProtocol {
    /// Whether connections speaking this protocol carry concurrent streams.
    pub fn is_multiplexed(self) -> bool {
        matches!(self, HttpProtocol::Http2)
    }
}

/// Record of a completed TLS handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol negotiated via ALPN.
    pub protocol: HttpProtocol,

    /// Hostnames the peer's certificate covers. Consulted when deciding
    /// whether a multiplexed connection may be coalesced across hosts.
    pub peer_hosts: Vec<String>,

    /// The negotiated cipher suite, if the factory reports one.
    pub cipher_suite: Option<String>,
}

impl Handshake {
    /// Whether the peer certificate covers `host`.
    pub fn covers(&self, host: &str) -> bool {
        self.peer_hosts.iter().any(|peer| {
            peer == host
                || peer
                    .strip_prefix("*.")
                    .and_then(|suffix| host.split_once('.').map(|(_, rest)| rest == suffix))
                    .unwrap_or(false)
        })
    }
}

/// An HTTP proxy choice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    host: String,
    port: u16,
}

impl Proxy {
    /// A proxy at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The proxy host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The proxy port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Upgrades a plain socket to TLS.
#[async_trait]
pub trait TlsFactory: Send + Sync {
    /// Perform the client handshake for `host`, advertising `protocols`
    /// via ALPN.
    async fn upgrade(
        &self,
        socket: BoxedSocket,
        host: &str,
        protocols: &[HttpProtocol],
    ) -> Result<(BoxedSocket, Handshake), Error>;
}

/// Decides whether a handshake is acceptable for a host, beyond what the
/// [`TlsFactory`] already verified. Used for HTTP/2 connection coalescing.
pub trait HostnameVerifier: Send + Sync {
    /// Whether `handshake` authenticates the peer for `host`.
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

/// Verifier that accepts a host when the peer certificate names cover it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerNameVerifier {
    _priv: (),
}

impl HostnameVerifier for PeerNameVerifier {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        handshake.covers(host)
    }
}

/// TLS collaborators for an address.
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) factory: Arc<dyn TlsFactory>,
    pub(crate) verifier: Arc<dyn HostnameVerifier>,
}

impl TlsConfig {
    /// TLS configuration with the default peer-name verifier.
    pub fn new(factory: Arc<dyn TlsFactory>) -> Self {
        Self {
            factory,
            verifier: Arc::new(PeerNameVerifier::default()),
        }
    }

    /// Replace the hostname verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn ptr_eq(&self, other: &TlsConfig) -> bool {
        Arc::ptr_eq(&self.factory, &other.factory) && Arc::ptr_eq(&self.verifier, &other.verifier)
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

/// Dials raw sockets.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Open a socket to the route's resolved address.
    async fn connect(&self, route: &Route) -> io::Result<BoxedSocket>;
}

/// Socket factory dialing plain TCP with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory {
    _priv: (),
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, route: &Route) -> io::Result<BoxedSocket> {
        let stream = tokio::net::TcpStream::connect(route.socket_addr()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Builds the protocol framing host for a freshly dialed socket.
///
/// The returned [`CodecHost`] takes ownership of the socket; per-exchange
/// [`Codec`]s are created from it for each request/response turn.
pub trait CodecFactory: Send + Sync {
    /// Frame `protocol` over `socket`.
    fn create(
        &self,
        socket: BoxedSocket,
        protocol: HttpProtocol,
    ) -> Result<Box<dyn CodecHost>, Error>;
}

/// The tuple identifying a server endpoint and how to reach it.
///
/// Address equality is the base eligibility key for pool hits: two requests
/// share connections only when every field here matches, with the injected
/// collaborators compared by identity.
#[derive(Clone)]
pub struct Address {
    host: String,
    port: u16,
    dns: Arc<dyn Dns>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<TlsConfig>,
    proxy: Option<Proxy>,
    protocols: Vec<HttpProtocol>,
}

impl Address {
    pub(crate) fn new(
        host: impl Into<String>,
        port: u16,
        dns: Arc<dyn Dns>,
        socket_factory: Arc<dyn SocketFactory>,
        tls: Option<TlsConfig>,
        proxy: Option<Proxy>,
        protocols: Vec<HttpProtocol>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            dns,
            socket_factory,
            tls,
            proxy,
            protocols,
        }
    }

    /// The server hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The DNS resolver for this address.
    pub fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    pub(crate) fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    /// TLS collaborators, if this address is reached over TLS.
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// The configured proxy, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Protocols the client is willing to speak, in preference order.
    pub fn protocols(&self) -> &[HttpProtocol] {
        &self.protocols
    }

    /// Whether this address is reached over TLS.
    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    /// Equality of everything except the hostname. A connection whose
    /// address matches non-host fields may still serve another host via
    /// HTTP/2 coalescing, subject to certificate checks.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.socket_factory, &other.socket_factory)
            && match (&self.tls, &other.tls) {
                (None, None) => true,
                (Some(a), Some(b)) => a.ptr_eq(b),
                _ => false,
            }
            && self.proxy == other.proxy
            && self.protocols == other.protocols
            && self.port == other.port
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_covers_exact_and_wildcard() {
        let handshake = Handshake {
            protocol: HttpProtocol::Http2,
            peer_hosts: vec!["example.com".into(), "*.cdn.example.com".into()],
            cipher_suite: None,
        };
        assert!(handshake.covers("example.com"));
        assert!(handshake.covers("a.cdn.example.com"));
        assert!(!handshake.covers("cdn.example.com"));
        assert!(!handshake.covers("other.com"));
    }

    #[test]
    fn protocol_multiplexing() {
        assert!(HttpProtocol::Http2.is_multiplexed());
        assert!(!HttpProtocol::Http1.is_multiplexed());
    }
}
