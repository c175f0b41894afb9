//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheStore;
use super::conn::dns::{Dns, GaiResolver};
use super::conn::pool::ConnectionPool;
use super::conn::route::RouteDatabase;
use super::conn::{
    BoxedSocket, CodecFactory, CodecHost, HttpProtocol, Proxy, SocketFactory, TcpSocketFactory,
    TlsConfig,
};
use super::dispatcher::Dispatcher;
use super::events::{EventListener, NoopListener};
use super::interceptor::bridge::{CookieJar, NoCookies};
use super::interceptor::retry::{FollowUpPolicy, NoFollowUp};
use super::interceptor::Interceptor;
use super::{Client, ClientInner};
use crate::error::Error;

/// Builder for [`Client`].
///
/// Everything has a default except the codec factory, which frames HTTP
/// over dialed sockets and must come from outside this crate.
pub struct Builder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    dns: Arc<dyn Dns>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<TlsConfig>,
    codec_factory: Arc<dyn CodecFactory>,
    cache: Option<Arc<dyn CacheStore>>,
    cookie_jar: Arc<dyn CookieJar>,
    follow_up: Arc<dyn FollowUpPolicy>,
    events: Arc<dyn EventListener>,
    proxy: Option<Proxy>,
    call_timeout: Option<Duration>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    user_agent: String,
    protocols: Vec<HttpProtocol>,
}

/// Placeholder factory for clients that were never given a real one:
/// dialing fails with a configuration error instead of a panic.
struct NoCodecs;

impl CodecFactory for NoCodecs {
    fn create(
        &self,
        _socket: BoxedSocket,
        _protocol: HttpProtocol,
    ) -> Result<Box<dyn CodecHost>, Error> {
        Err(Error::contract("no codec factory configured on this client"))
    }
}

impl Builder {
    pub(super) fn new() -> Self {
        Self {
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            dispatcher: Dispatcher::default(),
            pool: ConnectionPool::default(),
            dns: Arc::new(GaiResolver::new()),
            socket_factory: Arc::new(TcpSocketFactory::default()),
            tls: None,
            codec_factory: Arc::new(NoCodecs),
            cache: None,
            cookie_jar: Arc::new(NoCookies::default()),
            follow_up: Arc::new(NoFollowUp::default()),
            events: Arc::new(NoopListener::default()),
            proxy: None,
            call_timeout: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_owned(),
            protocols: vec![HttpProtocol::Http2, HttpProtocol::Http1],
        }
    }

    /// Add an application interceptor: runs once per call, before retries.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Add a network interceptor: runs once per attempt, with a live
    /// exchange.
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    /// Replace the dispatcher.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Share or replace the connection pool.
    pub fn pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the DNS resolver.
    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    /// Replace the socket factory.
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    /// Enable TLS with the given collaborators. Required for `https`
    /// requests.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the codec factory that frames HTTP over dialed sockets.
    pub fn codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = factory;
        self
    }

    /// Enable the response cache.
    pub fn cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Attach a cookie jar.
    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = jar;
        self
    }

    /// Set the follow-up policy (redirects, auth retries).
    pub fn follow_up_policy(mut self, policy: Arc<dyn FollowUpPolicy>) -> Self {
        self.follow_up = policy;
        self
    }

    /// Attach an event listener.
    pub fn event_listener(mut self, events: Arc<dyn EventListener>) -> Self {
        self.events = events;
        self
    }

    /// Route requests through a proxy.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Bound the entire call, from execute to the end of the response
    /// body. Unset by default.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Bound socket establishment per route attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read timeout hint exposed to codecs through the chain.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Write timeout hint exposed to codecs through the chain.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the default `User-Agent`.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Restrict the protocols to advertise, in preference order.
    /// `[Http2]` alone means cleartext prior-knowledge HTTP/2.
    pub fn protocols(mut self, protocols: Vec<HttpProtocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Finish the client.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                dispatcher: self.dispatcher,
                pool: self.pool,
                dns: self.dns,
                socket_factory: self.socket_factory,
                tls: self.tls,
                codec_factory: self.codec_factory,
                cache: self.cache,
                cookie_jar: self.cookie_jar,
                follow_up: self.follow_up,
                events: self.events,
                route_db: Arc::new(RouteDatabase::default()),
                proxy: self.proxy,
                call_timeout: self.call_timeout,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                user_agent: self.user_agent,
                protocols: self.protocols,
            }),
        }
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("protocols", &self.protocols)
            .finish()
    }
}
