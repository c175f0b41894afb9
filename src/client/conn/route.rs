//! Routes: concrete resolved paths to an address.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{Address, Proxy};
use crate::error::Error;

/// A concrete path to an [`Address`]: the proxy choice and the resolved
/// socket address a dial attempt will use.
#[derive(Clone)]
pub struct Route {
    address: Address,
    proxy: Option<Proxy>,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Address, proxy: Option<Proxy>, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    /// The address this route reaches.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The proxy this route goes through, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// The resolved address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    fn key(&self) -> RouteKey {
        RouteKey {
            host: self.address.host().to_owned(),
            port: self.address.port(),
            proxy: self.proxy.clone(),
            socket_addr: self.socket_addr,
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("address", &format_args!("{}", self.address))
            .field("proxy", &self.proxy)
            .field("socket_addr", &self.socket_addr)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    host: String,
    port: u16,
    proxy: Option<Proxy>,
    socket_addr: SocketAddr,
}

/// Shared memory of routes that recently failed to connect. Failed routes
/// are tried last on subsequent attempts rather than skipped outright.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<RouteKey>>,
}

impl RouteDatabase {
    /// Record a dial failure on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().insert(route.key());
    }

    /// Record a successful dial on `route`, clearing any failure memory.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().remove(&route.key());
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(&route.key())
    }
}

/// Iterates candidate routes for an address: DNS results in resolver order,
/// with recently failed routes postponed to the end.
pub(crate) struct RouteSelector {
    routes: std::vec::IntoIter<Route>,
}

impl RouteSelector {
    /// Resolve `address` and plan the dial order.
    pub(crate) async fn plan(address: &Address, db: &Arc<RouteDatabase>) -> Result<Self, Error> {
        let addrs = address
            .dns()
            .resolve(address.host(), address.port())
            .await
            .map_err(Error::dns)?;

        if addrs.is_empty() {
            return Err(Error::new(crate::ErrorKind::Dns)
                .with_message(format!("no addresses for {}", address.host())));
        }

        trace!(host = address.host(), count = addrs.len(), "routes planned");

        let mut fresh = Vec::with_capacity(addrs.len());
        let mut postponed = Vec::new();
        for addr in addrs {
            let route = Route::new(address.clone(), address.proxy().cloned(), addr);
            if db.should_postpone(&route) {
                postponed.push(route);
            } else {
                fresh.push(route);
            }
        }
        fresh.append(&mut postponed);

        Ok(Self {
            routes: fresh.into_iter(),
        })
    }

    /// All remaining candidate routes, in order.
    pub(crate) fn remaining(&self) -> &[Route] {
        self.routes.as_slice()
    }

    /// The next route to dial.
    pub(crate) fn next(&mut self) -> Option<Route> {
        self.routes.next()
    }

    /// Whether another route remains untried.
    pub(crate) fn has_next(&self) -> bool {
        self.routes.as_slice().len() > 0
    }
}
