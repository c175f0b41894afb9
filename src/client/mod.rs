//! The client: configuration, call creation, and the engine underneath.

use std::sync::Arc;
use std::time::Duration;

use http::Uri;

pub mod cache;
pub mod call;
pub mod conn;
pub mod dispatcher;
pub mod events;
pub mod interceptor;

mod builder;

pub use self::builder::Builder;
pub use self::call::Call;
pub use self::dispatcher::Dispatcher;
pub use self::events::{EventListener, NoopListener};

use self::cache::CacheStore;
use self::conn::dns::Dns;
use self::conn::pool::ConnectionPool;
use self::conn::route::RouteDatabase;
use self::conn::{Address, CodecFactory, HttpProtocol, Proxy, SocketFactory, TlsConfig};
use self::interceptor::bridge::CookieJar;
use self::interceptor::retry::FollowUpPolicy;
use self::interceptor::Interceptor;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// An HTTP client: a shared connection pool, a dispatcher, and the
/// configuration every call created through it inherits.
///
/// Clients are cheap to clone and intended to be shared; each clone uses
/// the same pool and dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) pool: ConnectionPool,
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) socket_factory: Arc<dyn SocketFactory>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) codec_factory: Arc<dyn CodecFactory>,
    pub(crate) cache: Option<Arc<dyn CacheStore>>,
    pub(crate) cookie_jar: Arc<dyn CookieJar>,
    pub(crate) follow_up: Arc<dyn FollowUpPolicy>,
    pub(crate) events: Arc<dyn EventListener>,
    pub(crate) route_db: Arc<RouteDatabase>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) user_agent: String,
    pub(crate) protocols: Vec<HttpProtocol>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A prepared call for `request`. Nothing happens until it is executed
    /// or enqueued.
    pub fn call(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request, false)
    }

    /// A call for a WebSocket upgrade request: network interceptors are
    /// skipped and a 101 response carries an empty body.
    pub fn web_socket(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request, true)
    }

    /// Convenience: GET `uri` and return the response.
    pub async fn get(&self, uri: Uri) -> Result<Response, Error> {
        self.call(Request::get(uri)).execute().await
    }

    /// The connection pool behind this client.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// The dispatcher running this client's enqueued calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

impl ClientInner {
    /// The address a request URI resolves to under this client's
    /// configuration.
    pub(crate) fn address_for(&self, uri: &Uri) -> Result<Address, Error> {
        let host = uri
            .host()
            .ok_or_else(|| Error::contract(format!("request uri has no host: {uri}")))?;

        let (https, default_port) = match uri.scheme_str() {
            Some("https") => (true, 443),
            Some("http") | None => (false, 80),
            Some(other) => {
                return Err(Error::contract(format!("unsupported scheme: {other}")));
            }
        };
        let port = uri.port_u16().unwrap_or(default_port);

        let tls = if https {
            Some(self.tls.clone().ok_or_else(|| {
                Error::contract("no TLS factory configured for an https request")
            })?)
        } else {
            None
        };

        Ok(Address::new(
            host,
            port,
            self.dns.clone(),
            self.socket_factory.clone(),
            tls,
            self.proxy.clone(),
            self.protocols.clone(),
        ))
    }
}
