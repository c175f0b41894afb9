//! The interceptor chain.
//!
//! Interceptors observe and rewrite requests on the way down and responses
//! on the way up. The chain itself is a descriptor (the ordered interceptor
//! slice plus a cursor); `proceed` invokes the interceptor at the cursor
//! with a child chain advanced by one. Re-entry is allowed where no
//! exchange is live - the retry stage proceeds once per attempt - and the
//! chain enforces the per-stage contracts everywhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub(crate) mod bridge;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

pub use bridge::{CookieJar, NoCookies};
pub use retry::{FollowUpPolicy, NoFollowUp};

use crate::client::call::{Call, CallInner};
use crate::client::conn::exchange::Exchange;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// A stage in the call pipeline.
///
/// An interceptor must call [`Chain::proceed`] exactly once, unless it
/// short-circuits by returning a response of its own (the cache stage does
/// this for cache-only hits). Application interceptors run once per call;
/// interceptors installed after the connect stage run once per attempt and
/// observe a live exchange.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Process `chain.request()`, typically by proceeding down the chain.
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error>;
}

/// The chain handle passed to each interceptor.
pub struct Chain {
    call: Arc<CallInner>,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    request: Request,
    exchange: Option<Arc<Exchange>>,
    calls: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Chain {
    pub(crate) fn new(
        call: Arc<CallInner>,
        interceptors: Arc<[Arc<dyn Interceptor>]>,
        request: Request,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            call,
            interceptors,
            index: 0,
            request,
            exchange: None,
            calls: 0,
            connect_timeout,
            read_timeout,
            write_timeout,
        }
    }

    /// The request as this stage sees it.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The call this chain is executing.
    pub fn call(&self) -> Call {
        Call::from_inner(self.call.clone())
    }

    pub(crate) fn call_inner(&self) -> &Arc<CallInner> {
        &self.call
    }

    /// The live exchange, present between the connect stage and the
    /// terminal stage.
    pub(crate) fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    pub(crate) fn set_exchange(&mut self, exchange: Arc<Exchange>) {
        self.exchange = Some(exchange);
    }

    /// Timeout budget for establishing a connection.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Timeout budget the codec should apply to reads.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Timeout budget the codec should apply to writes.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Hand `request` to the next stage and wait for its response.
    pub async fn proceed(&mut self, request: Request) -> Result<Response, Error> {
        if self.index >= self.interceptors.len() {
            return Err(Error::contract("proceeded past the end of the chain"));
        }

        self.calls += 1;

        if self.exchange.is_some() {
            if self.calls > 1 {
                return Err(Error::contract(format!(
                    "network interceptor {} must call proceed() exactly once",
                    self.index
                )));
            }
            if !same_endpoint(&self.request, &request) {
                return Err(Error::contract(format!(
                    "network interceptor {} must retain the same host and port",
                    self.index
                )));
            }
            let had_body = self
                .request
                .body()
                .map(|body| body.content_length() != Some(0))
                .unwrap_or(false);
            let has_body = request
                .body()
                .map(|body| body.content_length() != Some(0))
                .unwrap_or(false);
            if !had_body && has_body {
                return Err(Error::contract(format!(
                    "network interceptor {} added a request body to a body-less exchange",
                    self.index
                )));
            }
        }

        let interceptor = self.interceptors[self.index].clone();
        let mut next = Chain {
            call: self.call.clone(),
            interceptors: self.interceptors.clone(),
            index: self.index + 1,
            request,
            exchange: self.exchange.clone(),
            calls: 0,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };

        let response = interceptor.intercept(&mut next).await?;

        if next.exchange.is_some() && self.index + 1 < self.interceptors.len() && next.calls != 1 {
            return Err(Error::contract(format!(
                "network interceptor {} must call proceed() exactly once",
                self.index
            )));
        }

        Ok(response)
    }
}

fn same_endpoint(a: &Request, b: &Request) -> bool {
    a.uri().host() == b.uri().host() && a.uri().port_u16() == b.uri().port_u16()
}
