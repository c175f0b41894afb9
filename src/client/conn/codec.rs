//! The protocol codec boundary.
//!
//! A [`CodecHost`] owns one framed socket; a [`Codec`] is the per-exchange
//! reader/writer created from it. The engine never touches wire bytes -
//! everything below these traits is the collaborator's concern.

use crate::body::{ByteSink, ByteSource};
use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseHead;

use async_trait::async_trait;

/// A protocol-specific reader/writer for one request/response turn.
///
/// Methods are `&self`: implementations manage their own interior state, and
/// `cancel` must be callable from any task while another is mid-read.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Write the request line/frame and headers.
    async fn write_request_headers(&self, request: &Request) -> Result<(), Error>;

    /// Flush everything written so far to the socket.
    async fn flush_request(&self) -> Result<(), Error>;

    /// Open the request body sink. With `duplex` set the sink remains
    /// writable after the response has started.
    fn create_request_body(&self, request: &Request, duplex: bool) -> Result<ByteSink, Error>;

    /// Signal that the request (headers and body) is complete.
    async fn finish_request(&self) -> Result<(), Error>;

    /// Read the next response header frame.
    ///
    /// With `expect_continue` set, returns `None` when the server signalled
    /// that the request body should be sent (no early final response).
    async fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseHead>, Error>;

    /// Open the response body for `response`.
    fn open_response_body(&self, response: &ResponseHead) -> Result<ByteSource, Error>;

    /// Abort this exchange. Safe to call from any task; in-flight reads and
    /// writes fail promptly.
    fn cancel(&self);

    /// Whether the underlying connection carries concurrent streams.
    fn is_multiplexed(&self) -> bool;
}

/// The per-connection side of the codec: owns the socket and creates one
/// [`Codec`] per exchange.
pub trait CodecHost: Send + Sync {
    /// Create a codec for a new exchange.
    fn new_codec(&self) -> Result<Box<dyn Codec>, Error>;

    /// Whether the connection is usable for a new exchange. With `idle`
    /// set the connection has been sitting in the pool and the check may
    /// be more extensive (e.g. probing for an unexpected EOF).
    fn is_healthy(&self, idle: bool) -> bool;

    /// Whether the connection carries concurrent streams.
    fn is_multiplexed(&self) -> bool;

    /// Close the socket. Terminates every stream on a multiplexed
    /// connection.
    fn close(&self);
}
