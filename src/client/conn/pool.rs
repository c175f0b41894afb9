//! Connection pooling.
//!
//! The pool is a registry of live connections, idle and in-use alike. A
//! call acquires a connection by eligibility matching (address equality,
//! plus route coalescing for multiplexed protocols); connections whose last
//! call departs become idle and are evicted by a serialized cleanup task
//! once they outlive the keep-alive or exceed the idle budget. The same
//! task detects leaked calls through the weak references each connection
//! holds on its users.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::connection::{CallReference, ConnState, Connection};
use super::route::Route;
use super::Address;

/// Something that can hold a pooled connection: in practice, a call.
///
/// `connection_acquired` is invoked after the call's reference has been
/// appended to the connection's calls list, with no locks held.
pub(crate) trait ConnectionUser {
    /// A weak reference to the user, recorded on the connection.
    fn call_reference(&self) -> CallReference;

    /// The user now holds `connection`.
    fn connection_acquired(&self, connection: &Arc<Connection>);
}

/// A shared pool of transport connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connections: Mutex<Vec<Arc<Connection>>>,
    max_idle: usize,
    keep_alive: Duration,
    cleanup_wake: Notify,
    cleanup_running: AtomicBool,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5 * 60))
    }
}

impl ConnectionPool {
    /// A pool keeping at most `max_idle` idle connections, each for at most
    /// `keep_alive`.
    pub fn new(max_idle: usize, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: Mutex::new(Vec::new()),
                max_idle,
                keep_alive,
                cleanup_wake: Notify::new(),
                cleanup_running: AtomicBool::new(false),
            }),
        }
    }

    /// The number of connections in the pool, idle and in-use.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// The number of connections with no live calls.
    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|connection| connection.state().calls.is_empty())
            .count()
    }

    /// Attach `user` to a pooled connection eligible for `address`.
    ///
    /// Scans the registry; for each connection, under its lock, skips
    /// connections that refuse new exchanges, connections that are not
    /// multiplexed when `require_multiplexed` is set, and connections not
    /// eligible for the address (with `routes` enabling HTTP/2
    /// coalescing). On a match the user's reference is appended to the
    /// connection's calls list.
    pub(crate) fn acquire(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        user: &dyn ConnectionUser,
    ) -> bool {
        let connections = self.inner.connections.lock().clone();
        for connection in connections {
            {
                let mut state = connection.state();
                if require_multiplexed && !connection.is_multiplexed() {
                    continue;
                }
                if !connection.is_eligible(&state, address, routes) {
                    continue;
                }
                state.calls.push(user.call_reference());
            }
            trace!(id = connection.id(), %address, "reusing pooled connection");
            user.connection_acquired(&connection);
            return true;
        }
        false
    }

    /// Add a freshly dialed connection to the pool.
    pub(crate) fn put(&self, connection: Arc<Connection>) {
        debug_assert!(
            !connection.state().no_new_exchanges,
            "connection added to the pool after no_new_exchanges was set"
        );
        trace!(id = connection.id(), "connection added to pool");
        self.inner.connections.lock().push(connection);
        self.schedule_cleanup();
    }

    /// Called when the last call departs a connection, while the caller
    /// holds the connection's lock. Returns whether the caller must close
    /// the socket (the connection was removed rather than kept idle).
    pub(crate) fn connection_became_idle(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnState,
    ) -> bool {
        debug_assert!(state.calls.is_empty());
        if state.no_new_exchanges || self.inner.max_idle == 0 {
            state.removed = true;
            self.remove(connection);
            true
        } else {
            state.idle_since = Instant::now();
            self.schedule_cleanup();
            false
        }
    }

    /// Close and remove every connection with no live calls. Connections
    /// being evicted get `no_new_exchanges` set so concurrent acquirers
    /// stop using them.
    pub fn evict_all(&self) {
        let connections = self.inner.connections.lock().clone();
        let mut evicted = Vec::new();
        for connection in connections {
            let mut state = connection.state();
            if state.calls.is_empty() {
                state.no_new_exchanges = true;
                state.removed = true;
                drop(state);
                self.remove(&connection);
                evicted.push(connection);
            }
        }
        debug!(count = evicted.len(), "evicted idle connections");
        for connection in evicted {
            connection.close();
        }
    }

    fn remove(&self, connection: &Arc<Connection>) {
        self.inner
            .connections
            .lock()
            .retain(|candidate| candidate.id() != connection.id());
    }

    /// One pass of pool maintenance.
    ///
    /// Returns how long to wait before the next pass: zero when an eviction
    /// happened (run again immediately to catch cascades), the remaining
    /// keep-alive of the most-idle connection when there are idle
    /// connections, the full keep-alive when only in-use connections
    /// remain, and `None` when the pool is empty and the task can stop.
    pub(crate) fn cleanup(&self, now: Instant) -> Option<Duration> {
        let connections = self.inner.connections.lock().clone();

        let mut in_use = 0usize;
        let mut idle = 0usize;
        let mut longest: Option<(Arc<Connection>, Duration)> = None;

        for connection in &connections {
            let mut state = connection.state();

            // Leak pruning: a reclaimed weak reference means a call was
            // dropped without closing its response body.
            let mut leaked = false;
            state.calls.retain(|reference| {
                if reference.is_live() {
                    true
                } else {
                    warn!(
                        id = connection.id(),
                        "connection leaked: call dropped without closing its body; acquired at:\n{}",
                        reference.breadcrumb()
                    );
                    leaked = true;
                    false
                }
            });
            if leaked {
                state.no_new_exchanges = true;
                if state.calls.is_empty() {
                    // Backdate so the leaked connection evicts immediately.
                    state.idle_since = now
                        .checked_sub(self.inner.keep_alive)
                        .unwrap_or(state.idle_since);
                }
            }

            if !state.calls.is_empty() {
                in_use += 1;
                continue;
            }

            idle += 1;
            let idle_for = now.saturating_duration_since(state.idle_since);
            match &longest {
                Some((_, duration)) if *duration >= idle_for => {}
                _ => longest = Some((connection.clone(), idle_for)),
            }
        }

        if let Some((connection, longest_idle)) = longest {
            if longest_idle >= self.inner.keep_alive || idle > self.inner.max_idle {
                // Re-verify under the connection lock: a call may have
                // acquired it since the scan.
                let mut state = connection.state();
                if state.calls.is_empty()
                    && now.saturating_duration_since(state.idle_since) >= longest_idle
                {
                    state.no_new_exchanges = true;
                    state.removed = true;
                    drop(state);
                    self.remove(&connection);
                    trace!(id = connection.id(), ?longest_idle, "evicting idle connection");
                    connection.close();
                }
                return Some(Duration::ZERO);
            }
            return Some(self.inner.keep_alive - longest_idle);
        }

        if in_use > 0 {
            return Some(self.inner.keep_alive);
        }

        None
    }

    /// Wake the cleanup task, spawning it if it is not running. Outside a
    /// tokio runtime this is a no-op; tests drive `cleanup` directly.
    pub(crate) fn schedule_cleanup(&self) {
        self.inner.cleanup_wake.notify_one();
        if self
            .inner
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = self.clone();
                handle.spawn(async move { pool.cleanup_task().await });
            } else {
                self.inner.cleanup_running.store(false, Ordering::Release);
            }
        }
    }

    async fn cleanup_task(self) {
        loop {
            match self.cleanup(Instant::now()) {
                Some(delay) if delay.is_zero() => continue,
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.inner.cleanup_wake.notified() => {}
                    }
                }
                None => {
                    self.inner.cleanup_running.store(false, Ordering::Release);
                    // A connection may have arrived between the empty scan
                    // and the flag store.
                    if self.connection_count() > 0
                        && self
                            .inner
                            .cleanup_running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("max_idle", &self.inner.max_idle)
            .field("keep_alive", &self.inner.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::conn::connection::CallToken;
    use crate::client::conn::mock::{mock_address, mock_connection};
    use crate::client::conn::HttpProtocol;

    struct TestUser {
        token: Arc<CallToken>,
        acquired: Mutex<Option<Arc<Connection>>>,
    }

    impl TestUser {
        fn new() -> Self {
            Self {
                token: CallToken::new(),
                acquired: Mutex::new(None),
            }
        }

        fn acquired(&self) -> Option<Arc<Connection>> {
            self.acquired.lock().clone()
        }
    }

    impl ConnectionUser for TestUser {
        fn call_reference(&self) -> CallReference {
            CallReference::new(&self.token)
        }

        fn connection_acquired(&self, connection: &Arc<Connection>) {
            *self.acquired.lock() = Some(connection.clone());
        }
    }

    /// Build a pool of idle mock connections, each idle for the given age
    /// relative to the returned instant, so cleanup math is exact.
    fn pool_with_idle(
        max_idle: usize,
        keep_alive: Duration,
        ages: &[Duration],
    ) -> (ConnectionPool, Vec<Arc<Connection>>, Instant) {
        let pool = ConnectionPool::new(max_idle, keep_alive);
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let now = Instant::now();
        let mut connections = Vec::new();
        for age in ages {
            let connection = mock_connection(&address, HttpProtocol::Http1);
            connection.state().idle_since = now.checked_sub(*age).unwrap();
            pool.inner.connections.lock().push(connection.clone());
            connections.push(connection);
        }
        (pool, connections, now)
    }

    #[test]
    fn acquire_matches_address() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let connection = mock_connection(&address, HttpProtocol::Http1);
        pool.put(connection.clone());

        let user = TestUser::new();
        assert!(pool.acquire(&address, None, false, &user));
        assert_eq!(user.acquired().unwrap().id(), connection.id());
        assert_eq!(connection.state().calls.len(), 1);

        // An HTTP/1 connection with a live call is not eligible again.
        let second = TestUser::new();
        assert!(!pool.acquire(&address, None, false, &second));

        // Nor is it a multiplexed hit.
        let third = TestUser::new();
        assert!(!pool.acquire(&address, None, true, &third));
    }

    #[test]
    fn acquire_skips_no_new_exchanges() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);
        let connection = mock_connection(&address, HttpProtocol::Http1);
        pool.put(connection.clone());
        connection.no_new_exchanges();

        let user = TestUser::new();
        assert!(!pool.acquire(&address, None, false, &user));
    }

    #[test]
    fn idle_eviction_ladder() {
        // Three idle connections against max_idle=2, keep_alive=5s: the
        // oldest is evicted and cleanup asks to run again immediately;
        // the second pass reports the remaining keep-alive of the next
        // most idle connection.
        let keep_alive = Duration::from_secs(5);
        let (pool, connections, now) = pool_with_idle(
            2,
            keep_alive,
            &[
                Duration::from_secs(4),
                Duration::from_secs(3),
                Duration::from_secs(2),
            ],
        );

        assert_eq!(pool.cleanup(now), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 2);
        assert!(connections[0].state().removed);

        let delay = pool.cleanup(now).unwrap();
        assert_eq!(delay, keep_alive - Duration::from_secs(3));
        assert_eq!(pool.connection_count(), 2);
    }

    #[test]
    fn cleanup_evicts_past_keep_alive() {
        let (pool, _connections, now) =
            pool_with_idle(5, Duration::from_secs(5), &[Duration::from_secs(6)]);
        assert_eq!(pool.cleanup(now), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 0);
        // Pool is empty: cleanup stops scheduling.
        assert_eq!(pool.cleanup(now), None);
    }

    #[test]
    fn cleanup_delay_is_monotone_in_idle_age() {
        let keep_alive = Duration::from_secs(10);
        let (young, _, now) = pool_with_idle(5, keep_alive, &[Duration::from_secs(1)]);
        let (old, _, _) = pool_with_idle(5, keep_alive, &[Duration::from_secs(4)]);
        assert!(young.cleanup(now).unwrap() > old.cleanup(now).unwrap());
    }

    #[test]
    fn cleanup_reports_keep_alive_when_all_in_use() {
        let keep_alive = Duration::from_secs(7);
        let (pool, connections, _) = pool_with_idle(5, keep_alive, &[Duration::from_secs(1)]);
        let token = CallToken::new();
        connections[0]
            .state()
            .calls
            .push(CallReference::new(&token));

        assert_eq!(pool.cleanup(Instant::now()), Some(keep_alive));
    }

    #[test]
    fn cleanup_prunes_leaked_calls() {
        let keep_alive = Duration::from_secs(1);
        let (pool, connections, _) = pool_with_idle(5, keep_alive, &[Duration::ZERO]);

        {
            let token = CallToken::new();
            connections[0]
                .state()
                .calls
                .push(CallReference::new(&token));
            // Token dropped here without a release: a leak.
        }

        // The leaked reference is pruned, the connection is poisoned and
        // backdated, and the next pass evicts it immediately.
        assert_eq!(pool.cleanup(Instant::now()), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn evict_all_leaves_in_use_connections() {
        let (pool, connections, _) = pool_with_idle(
            5,
            Duration::from_secs(300),
            &[Duration::ZERO, Duration::ZERO, Duration::ZERO],
        );
        let token = CallToken::new();
        connections[1]
            .state()
            .calls
            .push(CallReference::new(&token));

        pool.evict_all();

        let busy: usize = pool
            .inner
            .connections
            .lock()
            .iter()
            .filter(|c| !c.state().calls.is_empty())
            .count();
        assert_eq!(pool.connection_count(), busy);
        assert_eq!(pool.connection_count(), 1);
        assert!(connections[0].state().removed);
        assert!(!connections[1].state().removed);
    }

    #[test]
    fn became_idle_keeps_or_closes() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let address = mock_address("example.com", 80, &["10.0.0.1:80"]);

        let keep = mock_connection(&address, HttpProtocol::Http1);
        pool.inner.connections.lock().push(keep.clone());
        {
            let mut state = keep.state();
            assert!(!pool.connection_became_idle(&keep, &mut state));
        }
        assert_eq!(pool.connection_count(), 1);

        let close = mock_connection(&address, HttpProtocol::Http1);
        pool.inner.connections.lock().push(close.clone());
        close.no_new_exchanges();
        {
            let mut state = close.state();
            assert!(pool.connection_became_idle(&close, &mut state));
        }
        assert_eq!(pool.connection_count(), 1);
    }
}
