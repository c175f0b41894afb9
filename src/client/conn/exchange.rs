//! A single request/response turn bound to a codec on a connection.
//!
//! The exchange wraps the codec's body streams so that closing either one
//! reports back to the owning call: the call's lifecycle bits are what
//! decide when the connection can be released and the terminal event fired.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::codec::Codec;
use super::connection::Connection;
use crate::body::{ByteSink, ByteSource};
use crate::client::call::CallInner;
use crate::client::events::EventListener;
use crate::error::Error;
use crate::request::Request;
use crate::response::{ResponseBody, ResponseHead};

static EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// One call's binding to one codec on one connection.
pub(crate) struct Exchange {
    id: u64,
    call: Weak<CallInner>,
    connection: Arc<Connection>,
    codec: Box<dyn Codec>,
    #[allow(dead_code)]
    events: Arc<dyn EventListener>,
    has_failure: AtomicBool,
}

impl Exchange {
    pub(crate) fn new(
        call: &Arc<CallInner>,
        connection: Arc<Connection>,
        codec: Box<dyn Codec>,
        events: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EXCHANGE_ID.fetch_add(1, Ordering::Relaxed),
            call: Arc::downgrade(call),
            connection,
            codec,
            events,
            has_failure: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.has_failure.load(Ordering::Acquire)
    }

    pub(crate) async fn write_request_headers(&self, request: &Request) -> Result<(), Error> {
        trace!(exchange = self.id, "writing request headers");
        self.codec
            .write_request_headers(request)
            .await
            .inspect_err(|error| self.track_failure(error))
    }

    pub(crate) async fn flush_request(&self) -> Result<(), Error> {
        self.codec
            .flush_request()
            .await
            .inspect_err(|error| self.track_failure(error))
    }

    pub(crate) fn create_request_body(
        self: &Arc<Self>,
        request: &Request,
        duplex: bool,
    ) -> Result<ByteSink, Error> {
        let inner = self
            .codec
            .create_request_body(request, duplex)
            .inspect_err(|error| self.track_failure(error))?;
        Ok(Box::pin(ExchangeSink {
            inner,
            exchange: self.clone(),
            completed: false,
        }))
    }

    /// The request carries no body: its half of the exchange is complete
    /// as soon as the headers are finished.
    pub(crate) fn no_request_body(&self) {
        self.message_done(true, false, None);
    }

    /// No response body will be read through this exchange (WebSocket
    /// upgrades hand the socket over instead).
    pub(crate) fn no_response_body(&self) {
        self.message_done(false, true, None);
    }

    pub(crate) async fn finish_request(&self) -> Result<(), Error> {
        self.codec
            .finish_request()
            .await
            .inspect_err(|error| self.track_failure(error))
    }

    pub(crate) async fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseHead>, Error> {
        self.codec
            .read_response_headers(expect_continue)
            .await
            .inspect_err(|error| self.track_failure(error))
    }

    pub(crate) fn open_response_body(
        self: &Arc<Self>,
        head: &ResponseHead,
    ) -> Result<ResponseBody, Error> {
        let source = self
            .codec
            .open_response_body(head)
            .inspect_err(|error| self.track_failure(error))?;
        let content_length = head
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let source: ByteSource = Box::pin(ExchangeSource {
            inner: source,
            exchange: self.clone(),
            completed: false,
        });
        Ok(ResponseBody::streaming(source, content_length))
    }

    /// Prevent the connection from carrying further exchanges.
    pub(crate) fn no_new_exchanges_on_connection(&self) {
        self.connection.no_new_exchanges();
    }

    /// Abort this exchange from any task.
    pub(crate) fn cancel(&self) {
        self.codec.cancel();
    }

    fn track_failure(&self, _error: &Error) {
        self.has_failure.store(true, Ordering::Release);
        self.connection.no_new_exchanges();
    }

    /// A body stream finished. Routes through the owning call's lifecycle
    /// bookkeeping; the returned error is the one to surface (the call may
    /// have wrapped it, or replaced it with a cancellation).
    pub(crate) fn message_done(
        &self,
        request_done: bool,
        response_done: bool,
        error: Option<Error>,
    ) -> Option<Error> {
        if error.is_some() {
            self.has_failure.store(true, Ordering::Release);
            self.connection.no_new_exchanges();
        }
        match self.call.upgrade() {
            Some(call) => call.message_done(self.id, request_done, response_done, error),
            None => error,
        }
    }

    /// The body stream was dropped without being run to completion: the
    /// connection cannot be reused, and the call is told the stream ended.
    fn message_aborted(&self, request_done: bool, response_done: bool) {
        self.connection.no_new_exchanges();
        let _ = self.message_done(
            request_done,
            response_done,
            Some(Error::transport(io::Error::other(
                "body dropped before completion",
            ))),
        );
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Request body sink that reports completion to the exchange when shut
/// down (or abandonment when dropped early).
struct ExchangeSink {
    inner: ByteSink,
    exchange: Arc<Exchange>,
    completed: bool,
}

impl ExchangeSink {
    fn complete(&mut self, error: Option<Error>) -> Option<Error> {
        if self.completed {
            return error;
        }
        self.completed = true;
        self.exchange.message_done(true, false, error)
    }
}

impl AsyncWrite for ExchangeSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_write(cx, buf) {
            Poll::Ready(Err(error)) => {
                let surfaced = this.complete(Some(Error::transport(error)));
                Poll::Ready(Err(into_io(surfaced)))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.complete(None);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                let surfaced = this.complete(Some(Error::transport(error)));
                Poll::Ready(Err(into_io(surfaced)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ExchangeSink {
    fn drop(&mut self) {
        if !self.completed {
            self.completed = true;
            self.exchange.message_aborted(true, false);
        }
    }
}

/// Response body source that reports EOF, errors, and abandonment to the
/// exchange.
struct ExchangeSource {
    inner: ByteSource,
    exchange: Arc<Exchange>,
    completed: bool,
}

impl ExchangeSource {
    fn complete(&mut self, error: Option<Error>) -> Option<Error> {
        if self.completed {
            return error;
        }
        self.completed = true;
        self.exchange.message_done(false, true, error)
    }
}

impl AsyncRead for ExchangeSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.completed {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before {
                    // EOF: the stream completed normally.
                    if let Some(error) = this.complete(None) {
                        return Poll::Ready(Err(into_io(Some(error))));
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                let surfaced = this.complete(Some(Error::transport(error)));
                Poll::Ready(Err(into_io(surfaced)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ExchangeSource {
    fn drop(&mut self) {
        if !self.completed {
            self.completed = true;
            self.exchange.message_aborted(false, true);
        }
    }
}

fn into_io(error: Option<Error>) -> io::Error {
    match error {
        Some(error) => io::Error::other(error),
        None => io::Error::other("stream failed"),
    }
}
