//! Acquiring a connection and codec for a call attempt.
//!
//! The preference order: reuse the connection the call already holds, hit
//! the pool by address, resolve routes and hit the pool again (which
//! enables HTTP/2 coalescing), and only then dial. A freshly dialed
//! connection still defers to a multiplexed connection another task
//! published while we were connecting.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::codec::Codec;
use super::connection::Connection;
use super::pool::{ConnectionPool, ConnectionUser};
use super::route::{Route, RouteDatabase, RouteSelector};
use super::{Address, CodecFactory, HttpProtocol};
use crate::client::call::CallInner;
use crate::error::Error;

pub(crate) struct ConnectionFinder {
    address: Address,
    pool: ConnectionPool,
    route_db: Arc<RouteDatabase>,
    codec_factory: Arc<dyn CodecFactory>,
    connect_timeout: Duration,
    selector: Option<RouteSelector>,
    /// A route we dialed successfully but then abandoned in favor of a
    /// coalesced connection. Preferred on the next dial.
    next_route: Option<Route>,
}

impl ConnectionFinder {
    pub(crate) fn new(
        address: Address,
        pool: ConnectionPool,
        route_db: Arc<RouteDatabase>,
        codec_factory: Arc<dyn CodecFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            address,
            pool,
            route_db,
            codec_factory,
            connect_timeout,
            selector: None,
            next_route: None,
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    fn remember_route(&mut self, connection: &Arc<Connection>) {
        if self.next_route.is_none() && connection.route().address() == &self.address {
            self.next_route = Some(connection.route().clone());
        }
    }

    /// Whether another route remains to try after a hard failure.
    pub(crate) fn retry_after_failure(&self) -> bool {
        self.next_route.is_some()
            || self
                .selector
                .as_ref()
                .map(|selector| selector.has_next())
                // Routes not resolved yet: a retry will plan them.
                .unwrap_or(true)
    }

    /// Obtain a healthy connection and a codec bound to it.
    pub(crate) async fn find(
        &mut self,
        call: &Arc<CallInner>,
    ) -> Result<(Arc<Connection>, Box<dyn Codec>), Error> {
        loop {
            let (connection, fresh) = self.find_connection(call).await?;

            // Reused connections get the extensive check; they may have
            // rotted in the pool.
            if !connection.is_healthy(!fresh) {
                trace!(id = connection.id(), "connection failed health check");
                connection.no_new_exchanges();
                self.remember_route(&connection);
                call.release_connection();
                continue;
            }

            match connection.new_codec() {
                Ok(codec) => return Ok((connection, codec)),
                Err(_) => {
                    connection.no_new_exchanges();
                    call.release_connection();
                }
            }
        }
    }

    async fn find_connection(
        &mut self,
        call: &Arc<CallInner>,
    ) -> Result<(Arc<Connection>, bool), Error> {
        if call.is_canceled() {
            return Err(Error::canceled());
        }

        // 1. The connection the call already holds, if still eligible.
        if let Some(held) = call.held_connection() {
            let reusable = {
                let state = held.state();
                !state.no_new_exchanges
                    && held.route().address().host() == self.address.host()
                    && held.route().address().equals_non_host(&self.address)
            };
            if reusable {
                trace!(id = held.id(), "reusing held connection");
                return Ok((held, false));
            }
            // The held connection is dead, but its route connected once:
            // prefer it for the replacement dial.
            self.remember_route(&held);
            call.release_connection();
        }

        // 2. A pool hit by address alone.
        if self.pool.acquire(&self.address, None, false, call.as_ref()) {
            let connection = call.held_connection().expect("acquire attached connection");
            return Ok((connection, false));
        }

        // 3. Resolve routes; a pool hit with routes can coalesce onto a
        // multiplexed connection serving another host at the same IP.
        if self.selector.is_none() {
            self.selector = Some(RouteSelector::plan(&self.address, &self.route_db).await?);
        }
        let routes: Vec<Route> = {
            let mut routes: Vec<Route> = self.next_route.iter().cloned().collect();
            routes.extend(
                self.selector
                    .as_ref()
                    .expect("selector planned above")
                    .remaining()
                    .iter()
                    .cloned(),
            );
            routes
        };
        if !routes.is_empty() && self.pool.acquire(&self.address, Some(&routes), false, call.as_ref())
        {
            let connection = call.held_connection().expect("acquire attached connection");
            return Ok((connection, false));
        }

        // 4. Dial candidate routes in order until one connects.
        let mut last_error: Option<Error> = None;
        loop {
            let Some(route) = self.next_route.take().or_else(|| {
                self.selector
                    .as_mut()
                    .expect("selector planned above")
                    .next()
            }) else {
                break;
            };

            if call.is_canceled() {
                return Err(Error::canceled());
            }

            match self.dial(&route).await {
                Ok(connection) => {
                    self.route_db.connected(&route);

                    // Another task may have published a multiplexed
                    // connection to this address while we dialed; prefer
                    // theirs and keep our route for a future attempt.
                    if self.pool.acquire(
                        &self.address,
                        Some(std::slice::from_ref(&route)),
                        true,
                        call.as_ref(),
                    ) {
                        debug!(id = connection.id(), "discarding dialed connection for a coalesced one");
                        connection.close();
                        self.next_route = Some(route);
                        let connection =
                            call.held_connection().expect("acquire attached connection");
                        return Ok((connection, false));
                    }

                    {
                        let mut state = connection.state();
                        state.calls.push(call.call_reference());
                    }
                    call.connection_acquired(&connection);
                    self.pool.put(connection.clone());
                    return Ok((connection, true));
                }
                Err(error) => {
                    debug!(?route, %error, "dial failed");
                    self.route_db.failed(&route);
                    last_error = Some(match last_error.take() {
                        Some(previous) => error.with_suppressed(previous),
                        None => error,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::transport(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("exhausted routes to {}", self.address),
            ))
        }))
    }

    async fn dial(&self, route: &Route) -> Result<Arc<Connection>, Error> {
        trace!(?route, "dialing");
        let socket = tokio::time::timeout(
            self.connect_timeout,
            route.address().socket_factory().connect(route),
        )
        .await
        .map_err(|_| {
            Error::transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timeout to {route:?}"),
            ))
        })?
        .map_err(Error::transport)?;

        let (socket, handshake, protocol) = match route.address().tls() {
            Some(tls) => {
                let (socket, handshake) = tls
                    .factory
                    .upgrade(socket, route.address().host(), route.address().protocols())
                    .await?;
                let protocol = handshake.protocol;
                (socket, Some(handshake), protocol)
            }
            None => {
                // Cleartext HTTP/2 requires prior knowledge.
                let protocol = match route.address().protocols() {
                    [HttpProtocol::Http2] => HttpProtocol::Http2,
                    _ => HttpProtocol::Http1,
                };
                (socket, None, protocol)
            }
        };

        let host = self.codec_factory.create(socket, protocol)?;
        Ok(Connection::new(route.clone(), protocol, handshake, host))
    }
}
