//! Calls: one-shot request/response operations.
//!
//! A call owns its exchange, its timeout, and three lifecycle bits - the
//! request body, the response body, and the expectation of further
//! exchanges. The call is done when all three are clear; at that moment it
//! releases its connection, fires the terminal event, and can never run
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::conn::connection::{CallReference, CallToken, Connection};
use super::conn::exchange::Exchange;
use super::conn::finder::ConnectionFinder;
use super::conn::pool::ConnectionUser;
use super::conn::weakopt::WeakOpt;
use super::interceptor::bridge::BridgeInterceptor;
use super::interceptor::call_server::CallServerInterceptor;
use super::interceptor::connect::ConnectInterceptor;
use super::interceptor::retry::RetryInterceptor;
use super::interceptor::{Chain, Interceptor};
use super::ClientInner;
use crate::client::cache::CacheInterceptor;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// A prepared, one-shot request/response operation.
///
/// Obtained from [`crate::Client::call`]. Executing consumes the one-shot
/// budget; [`Call::clone_call`] produces a fresh call with the same
/// request.
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientInner>, request: Request, web_socket: bool) -> Self {
        Self {
            inner: Arc::new(CallInner {
                client,
                request,
                web_socket,
                token: CallToken::new(),
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                timeout_fired: AtomicBool::new(false),
                timeout_early_exited: AtomicBool::new(false),
                watchdog: Mutex::new(None),
                finder: tokio::sync::Mutex::new(None),
                state: Mutex::new(CallState::default()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CallInner>) -> Self {
        Self { inner }
    }

    /// The request this call will execute.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Whether `execute` or `enqueue` has been invoked.
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::Acquire)
    }

    /// Whether the call has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Cancel the call, from any task. Idempotent. The current exchange
    /// and any connection mid-handshake are aborted.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// The configured call timeout, if any.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.inner.client.call_timeout
    }

    /// Disarm the call timeout early, once setup has completed. Used by
    /// WebSocket upgrades and duplex calls, whose lifetime is open-ended.
    pub fn timeout_early_exit(&self) {
        self.inner.timeout_early_exit();
    }

    /// A fresh, unexecuted call with an identical request.
    pub fn clone_call(&self) -> Call {
        Call::new(
            self.inner.client.clone(),
            self.inner.request.clone(),
            self.inner.web_socket,
        )
    }

    /// Execute the call on this task, returning the response once its
    /// headers have arrived. The response body streams; the call finishes
    /// when it is consumed or closed.
    pub async fn execute(&self) -> Result<Response, Error> {
        self.inner.guard_one_shot()?;
        self.inner.timeout_enter();
        self.inner.client.events.call_start();
        self.inner.client.dispatcher.executed();
        let result = self.inner.clone().run().await;
        self.inner.client.dispatcher.finished();
        result
    }

    /// Execute the call on the dispatcher's budget; `callback` receives
    /// the outcome. Fails immediately if the call was already executed.
    pub fn enqueue<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        self.inner.guard_one_shot()?;
        self.inner.client.events.call_start();
        self.inner
            .client
            .dispatcher
            .enqueue(self.inner.clone(), Box::new(callback));
        Ok(())
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("request", &format_args!("{}", self.inner.request))
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[derive(Default)]
struct CallState {
    request_body_open: bool,
    response_body_open: bool,
    expect_more_exchanges: bool,
    exchange: Option<Arc<Exchange>>,
    connection: Option<Arc<Connection>>,
    connection_to_cancel: ConnToCancel,
}

struct ConnToCancel(WeakOpt<Connection>);

impl Default for ConnToCancel {
    fn default() -> Self {
        Self(WeakOpt::none())
    }
}

pub(crate) struct CallInner {
    pub(crate) client: Arc<ClientInner>,
    request: Request,
    web_socket: bool,
    token: Arc<CallToken>,
    executed: AtomicBool,
    canceled: AtomicBool,
    finished: AtomicBool,
    timeout_fired: AtomicBool,
    timeout_early_exited: AtomicBool,
    watchdog: Mutex<Option<tokio::task::JoinHandle<()>>>,
    finder: tokio::sync::Mutex<Option<ConnectionFinder>>,
    state: Mutex<CallState>,
}

impl CallInner {
    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn guard_one_shot(&self) -> Result<(), Error> {
        self.executed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::contract("call already executed"))?;
        Ok(())
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(request = %self.request, "call canceled");
        let (exchange, connection) = {
            let state = self.state.lock();
            (
                state.exchange.clone(),
                state.connection_to_cancel.0.upgrade(),
            )
        };
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
        if let Some(connection) = connection {
            connection.cancel();
        }
        self.client.events.canceled();
    }

    /// Drive the interceptor chain to a response.
    pub(crate) async fn run(self: Arc<Self>) -> Result<Response, Error> {
        self.state.lock().expect_more_exchanges = true;

        let mut stack: Vec<Arc<dyn Interceptor>> = Vec::new();
        stack.extend(self.client.interceptors.iter().cloned());
        stack.push(Arc::new(RetryInterceptor::new(self.client.follow_up.clone())));
        stack.push(Arc::new(BridgeInterceptor::new(
            self.client.cookie_jar.clone(),
            self.client.user_agent.clone(),
        )));
        stack.push(Arc::new(CacheInterceptor::new(
            self.client.cache.clone(),
            self.client.events.clone(),
        )));
        stack.push(Arc::new(ConnectInterceptor::default()));
        if !self.web_socket {
            stack.extend(self.client.network_interceptors.iter().cloned());
        }
        stack.push(Arc::new(CallServerInterceptor::new(self.web_socket)));

        let mut chain = Chain::new(
            self.clone(),
            stack.into(),
            self.request.clone(),
            self.client.connect_timeout,
            self.client.read_timeout,
            self.client.write_timeout,
        );

        match chain.proceed(self.request.clone()).await {
            Ok(response) => {
                if self.is_canceled() {
                    // The network may have succeeded, but the caller never
                    // sees a response after cancel: close it and fail.
                    drop(response);
                    let error = self.no_more_exchanges(Some(Error::canceled()));
                    return Err(error.expect("error in, error out"));
                }
                if let Some(error) = self.no_more_exchanges(None) {
                    return Err(error);
                }
                Ok(response)
            }
            Err(error) => {
                let error = self.no_more_exchanges(Some(error));
                Err(error.expect("error in, error out"))
            }
        }
    }

    /// The chain returned (or failed): no further exchanges will happen.
    /// If both body streams are already closed, the call is done now.
    fn no_more_exchanges(&self, error: Option<Error>) -> Option<Error> {
        let all_closed = {
            let mut state = self.state.lock();
            if !state.expect_more_exchanges {
                return error;
            }
            state.expect_more_exchanges = false;
            !state.request_body_open && !state.response_body_open
        };
        if all_closed {
            return self.call_done(error);
        }
        error
    }

    /// A body stream of `exchange_id` finished. Clears the corresponding
    /// lifecycle bit; when both bits clear, the exchange is dropped and the
    /// connection credited; when all three bits are clear, the call is
    /// done.
    pub(crate) fn message_done(
        &self,
        exchange_id: u64,
        request_done: bool,
        response_done: bool,
        error: Option<Error>,
    ) -> Option<Error> {
        // Cancellation wins over whatever the stream failure was.
        let error = match error {
            Some(error) if self.is_canceled() && !error.is_canceled() => {
                Some(Error::canceled().with_source(error))
            }
            other => other,
        };

        let mut finished_exchange: Option<Arc<Exchange>> = None;
        let call_is_done;
        {
            let mut state = self.state.lock();
            match &state.exchange {
                // A detached exchange reports to nobody.
                Some(exchange) if exchange.id() == exchange_id => {}
                _ => return error,
            }

            let mut changed = false;
            if request_done && state.request_body_open {
                state.request_body_open = false;
                changed = true;
            }
            if response_done && state.response_body_open {
                state.response_body_open = false;
                changed = true;
            }
            if !changed {
                return error;
            }

            if !state.request_body_open && !state.response_body_open {
                finished_exchange = state.exchange.take();
            }
            call_is_done = finished_exchange.is_some() && !state.expect_more_exchanges;
        }

        if let Some(exchange) = finished_exchange {
            trace!(exchange = exchange.id(), "exchange finished");
            if !exchange.has_failure() {
                exchange.connection().record_success();
            }
        }

        if call_is_done {
            return self.call_done(error);
        }
        error
    }

    /// Terminal bookkeeping, run exactly once.
    fn call_done(&self, error: Option<Error>) -> Option<Error> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return error;
        }

        self.release_connection();
        self.timeout_exit();

        let error = match error {
            Some(error) if self.timeout_fired.load(Ordering::Acquire) => {
                Some(Error::timeout(error))
            }
            other => other,
        };

        match &error {
            Some(error) => self.client.events.call_failed(error),
            None => self.client.events.call_end(),
        }
        error
    }

    /// Remove this call from its connection's calls list; if that empties
    /// the list, let the pool decide whether the connection idles or
    /// closes.
    pub(crate) fn release_connection(&self) {
        let connection = { self.state.lock().connection.take() };
        let Some(connection) = connection else {
            return;
        };

        let should_close = {
            let mut state = connection.state();
            if let Some(index) = state
                .calls
                .iter()
                .position(|reference| reference.is_for(&self.token))
            {
                state.calls.remove(index);
            }
            if state.calls.is_empty() && !state.removed {
                self.client
                    .pool
                    .connection_became_idle(&connection, &mut state)
            } else {
                false
            }
        };

        if should_close {
            connection.close();
        }
        trace!(id = connection.id(), "connection released");
        self.client.events.connection_released();
    }

    pub(crate) fn held_connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().connection.clone()
    }

    /// Create the exchange for one attempt: acquire a connection and codec
    /// through the finder and open both lifecycle bits.
    pub(crate) async fn init_exchange(
        self: &Arc<Self>,
        chain: &Chain,
    ) -> Result<Arc<Exchange>, Error> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }
        {
            let state = self.state.lock();
            if !state.expect_more_exchanges {
                return Err(Error::contract("call is already released"));
            }
            if state.request_body_open || state.response_body_open {
                return Err(Error::contract(
                    "cannot make a new request because the previous response is still open",
                ));
            }
        }

        let address = self.client.address_for(chain.request().uri())?;
        let mut finder_slot = self.finder.lock().await;
        match finder_slot.as_ref() {
            Some(finder) if *finder.address() == address => {}
            _ => {
                *finder_slot = Some(ConnectionFinder::new(
                    address,
                    self.client.pool.clone(),
                    self.client.route_db.clone(),
                    self.client.codec_factory.clone(),
                    self.client.connect_timeout,
                ));
            }
        }
        let finder = finder_slot.as_mut().expect("finder installed above");

        let (connection, codec) = finder.find(self).await?;
        let exchange = Exchange::new(self, connection, codec, self.client.events.clone());

        {
            let mut state = self.state.lock();
            state.exchange = Some(exchange.clone());
            state.request_body_open = true;
            state.response_body_open = true;
        }

        Ok(exchange)
    }

    /// Detach the current exchange between attempts. Clears both body bits
    /// without terminal bookkeeping; `expect_more_exchanges` is still set
    /// while the retry stage runs.
    pub(crate) fn exit_exchange(&self, close: bool) {
        let exchange = {
            let mut state = self.state.lock();
            state.request_body_open = false;
            state.response_body_open = false;
            state.exchange.take()
        };
        if let Some(exchange) = exchange {
            if close {
                exchange.cancel();
            }
        }
    }

    /// Whether the finder has another route to offer after a failure.
    pub(crate) async fn retry_after_failure(&self) -> bool {
        self.finder
            .lock()
            .await
            .as_ref()
            .map(|finder| finder.retry_after_failure())
            .unwrap_or(false)
    }

    pub(crate) fn timeout_enter(self: &Arc<Self>) {
        let Some(timeout) = self.client.call_timeout else {
            return;
        };
        if self.timeout_early_exited.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(call) = weak.upgrade() {
                debug!("call timeout fired");
                call.timeout_fired.store(true, Ordering::Release);
                call.cancel();
            }
        });
        *self.watchdog.lock() = Some(handle);
    }

    fn timeout_exit(&self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }

    pub(crate) fn timeout_early_exit(&self) {
        self.timeout_early_exited.store(true, Ordering::Release);
        self.timeout_exit();
    }
}

impl ConnectionUser for CallInner {
    fn call_reference(&self) -> CallReference {
        CallReference::new(&self.token)
    }

    fn connection_acquired(&self, connection: &Arc<Connection>) {
        let mut state = self.state.lock();
        debug_assert!(state.connection.is_none(), "call already holds a connection");
        state.connection = Some(connection.clone());
        state.connection_to_cancel = ConnToCancel(WeakOpt::downgrade(connection));
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }
}
