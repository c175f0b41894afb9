//! A live transport connection and its call bookkeeping.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::codec::{Codec, CodecHost};
use super::route::Route;
use super::{Address, Handshake, HttpProtocol};
use crate::error::Error;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How many concurrent exchanges a multiplexed connection will accept.
const MULTIPLEX_ALLOCATION_LIMIT: usize = 128;

/// A token owned by each call for the duration of its life. Connections
/// hold weak handles to it: a handle that no longer upgrades means the
/// owning call was dropped without releasing the connection.
pub(crate) struct CallToken {
    id: u64,
}

static CALL_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

impl CallToken {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: CALL_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// A weak handle to a call holding this connection, plus the breadcrumb
/// captured when the call acquired it. The breadcrumb is what gets logged
/// when the handle is found reclaimed.
pub(crate) struct CallReference {
    token: Weak<CallToken>,
    breadcrumb: Arc<Backtrace>,
}

impl CallReference {
    pub(crate) fn new(token: &Arc<CallToken>) -> Self {
        Self {
            token: Arc::downgrade(token),
            breadcrumb: Arc::new(Backtrace::capture()),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.token.strong_count() > 0
    }

    pub(crate) fn is_for(&self, token: &Arc<CallToken>) -> bool {
        self.token
            .upgrade()
            .map(|held| held.id == token.id)
            .unwrap_or(false)
    }

    pub(crate) fn breadcrumb(&self) -> &Backtrace {
        &self.breadcrumb
    }
}

/// State guarded by the connection's own mutex.
pub(crate) struct ConnState {
    /// Calls currently allowed to run exchanges on this connection.
    pub(crate) calls: Vec<CallReference>,

    /// Once set, this connection never accepts another exchange.
    pub(crate) no_new_exchanges: bool,

    /// Once removed from the pool, a connection is never re-added.
    pub(crate) removed: bool,

    /// When the calls list last became empty.
    pub(crate) idle_since: Instant,

    /// Completed exchanges, for diagnostics.
    pub(crate) success_count: u64,

    /// Maximum concurrent calls: 1 for HTTP/1.1.
    pub(crate) allocation_limit: usize,
}

/// A pooled transport connection.
///
/// The socket itself lives inside the [`CodecHost`]; the connection tracks
/// who is using it and whether it may carry more exchanges.
pub struct Connection {
    id: u64,
    route: Route,
    protocol: HttpProtocol,
    handshake: Option<Handshake>,
    host: Box<dyn CodecHost>,
    state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(
        route: Route,
        protocol: HttpProtocol,
        handshake: Option<Handshake>,
        host: Box<dyn CodecHost>,
    ) -> Arc<Self> {
        let allocation_limit = if protocol.is_multiplexed() {
            MULTIPLEX_ALLOCATION_LIMIT
        } else {
            1
        };
        Arc::new(Self {
            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol,
            handshake,
            host,
            state: Mutex::new(ConnState {
                calls: Vec::new(),
                no_new_exchanges: false,
                removed: false,
                idle_since: Instant::now(),
                success_count: 0,
                allocation_limit,
            }),
        })
    }

    /// A number identifying this connection in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The route this connection was dialed over.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The negotiated protocol.
    pub fn protocol(&self) -> HttpProtocol {
        self.protocol
    }

    /// The TLS handshake, if the connection is encrypted.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Whether this connection carries concurrent streams.
    pub fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed() && self.host.is_multiplexed()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock()
    }

    /// Stop accepting exchanges on this connection.
    pub(crate) fn no_new_exchanges(&self) {
        self.state.lock().no_new_exchanges = true;
    }

    pub(crate) fn is_healthy(&self, idle: bool) -> bool {
        self.host.is_healthy(idle)
    }

    /// Create a codec for a new exchange on this connection.
    pub(crate) fn new_codec(&self) -> Result<Box<dyn Codec>, Error> {
        {
            let state = self.state.lock();
            if state.no_new_exchanges {
                return Err(Error::shutdown());
            }
        }
        self.host.new_codec()
    }

    /// Close the socket. The last step of eviction.
    pub(crate) fn close(&self) {
        trace!(id = self.id, "closing connection");
        self.host.close();
    }

    /// Abort everything on this connection, including an in-progress
    /// handshake: closing the socket terminates every multiplexed stream.
    pub(crate) fn cancel(&self) {
        self.host.close();
    }

    pub(crate) fn record_success(&self) {
        self.state.lock().success_count += 1;
    }

    /// Whether this connection may carry a new exchange to `address`.
    ///
    /// Must be called with the connection lock held (pass the guard's
    /// state). `routes`, when known, enables HTTP/2 coalescing: a
    /// multiplexed connection whose resolved IP matches one of the
    /// candidate routes may serve a different hostname, provided the
    /// peer certificate covers it.
    pub(crate) fn is_eligible(
        &self,
        state: &ConnState,
        address: &Address,
        routes: Option<&[Route]>,
    ) -> bool {
        if state.no_new_exchanges || state.removed || state.calls.len() >= state.allocation_limit {
            return false;
        }

        if !self.route.address().equals_non_host(address) {
            return false;
        }

        if address.host() == self.route.address().host() {
            return true;
        }

        // Everything below is HTTP/2 coalescing across hostnames.
        if !self.is_multiplexed() {
            return false;
        }

        let Some(routes) = routes else {
            return false;
        };
        if self.route.proxy().is_some()
            || !routes.iter().any(|route| {
                route.proxy().is_none() && route.socket_addr() == self.route.socket_addr()
            })
        {
            return false;
        }

        let Some(tls) = address.tls() else {
            return false;
        };
        let Some(handshake) = &self.handshake else {
            return false;
        };
        tls.verifier.verify(address.host(), handshake)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::conn::mock::{mock_address, mock_connection, mock_tls_address};

    #[test]
    fn call_reference_tracks_liveness() {
        let token = CallToken::new();
        let reference = CallReference::new(&token);
        assert!(reference.is_live());
        assert!(reference.is_for(&token));

        let other = CallToken::new();
        assert!(!reference.is_for(&other));

        drop(token);
        assert!(!reference.is_live());
    }

    #[test]
    fn eligibility_requires_matching_address() {
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let conn = mock_connection(&address, HttpProtocol::Http1);

        let state = conn.state();
        assert!(conn.is_eligible(&state, &address, None));

        let other = mock_address("other.com", 80, &["10.0.0.1:80"]);
        assert!(!conn.is_eligible(&state, &other, None));
    }

    #[test]
    fn no_new_exchanges_blocks_eligibility() {
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let conn = mock_connection(&address, HttpProtocol::Http1);
        conn.no_new_exchanges();

        {
            let state = conn.state();
            assert!(!conn.is_eligible(&state, &address, None));
        }
        assert!(conn.new_codec().is_err());
    }

    #[test]
    fn h1_connection_is_exclusive() {
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let conn = mock_connection(&address, HttpProtocol::Http1);

        let token = CallToken::new();
        {
            let mut state = conn.state();
            state.calls.push(CallReference::new(&token));
            assert!(!conn.is_eligible(&state, &address, None));
        }
    }

    #[test]
    fn coalescing_requires_route_and_certificate() {
        let (address, conn) = mock_tls_address(
            "example.com",
            &["10.0.0.1:443"],
            &["example.com", "alt.example.com"],
        );
        let alt = address_for_host(&address, "alt.example.com");
        let stranger = address_for_host(&address, "stranger.com");

        let routes = vec![Route::new(
            alt.clone(),
            None,
            "10.0.0.1:443".parse().unwrap(),
        )];

        let state = conn.state();
        // Same IP, certificate covers the host.
        assert!(conn.is_eligible(&state, &alt, Some(&routes)));
        // No known routes: no coalescing.
        assert!(!conn.is_eligible(&state, &alt, None));
        // Certificate does not cover the host.
        let routes = vec![Route::new(
            stranger.clone(),
            None,
            "10.0.0.1:443".parse().unwrap(),
        )];
        assert!(!conn.is_eligible(&state, &stranger, Some(&routes)));
    }

    fn address_for_host(address: &Address, host: &str) -> Address {
        Address::new(
            host,
            address.port(),
            address.dns().clone(),
            address.socket_factory().clone(),
            address.tls().cloned(),
            address.proxy().cloned(),
            address.protocols().to_vec(),
        )
    }
}
