//! Responses and response bodies.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::HeaderMap;
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::body::ByteSource;
use crate::client::conn::Handshake;
use crate::request::Request;
use crate::DebugLiteral;

/// The head of a response as produced by a codec: status line and headers,
/// before any body bytes are read.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// The response status.
    pub status: StatusCode,
    /// The negotiated HTTP version.
    pub version: Version,
    /// The response headers.
    pub headers: HeaderMap,
}

/// An HTTP response.
///
/// Carries the request that produced it, wall-clock stamps for the send and
/// receive moments (used by cache freshness math), and - where applicable -
/// the stripped cache and network responses it was combined from.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    request: Request,
    sent_at: SystemTime,
    received_at: SystemTime,
    handshake: Option<Handshake>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
}

impl Response {
    /// Start building a response.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The negotiated HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of `name`, as a string, if present and valid UTF-8.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|value| value.to_str().ok())
    }

    /// The request that produced this response (after interceptor
    /// rewriting; body stripped).
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// When the request headers were written to the wire.
    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    /// When the response headers were read from the wire.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// The TLS handshake of the connection that carried this response.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The cached response this one was validated against, body stripped.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The raw network response this one was derived from, body stripped.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// Take the response body, leaving `None` behind.
    pub fn body_mut(&mut self) -> &mut Option<ResponseBody> {
        &mut self.body
    }

    /// Consume the response, returning its body.
    pub fn into_body(self) -> Option<ResponseBody> {
        self.body
    }

    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// This response with its body and ancestry dropped, for use as a
    /// `cache_response`/`network_response` record.
    pub(crate) fn strip_body(&self) -> Response {
        Response {
            status: self.status,
            version: self.version,
            headers: self.headers.clone(),
            body: None,
            request: self.request.clone(),
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake.clone(),
            cache_response: None,
            network_response: None,
        }
    }

    /// Rebuild this response with different parts, keeping the rest.
    pub(crate) fn into_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            status: self.status,
            version: self.version,
            headers: self.headers,
            body: self.body,
            request: Some(self.request),
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake,
            cache_response: self.cache_response,
            network_response: self.network_response,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("request", &format_args!("{}", self.request))
            .finish()
    }
}

/// Builder for [`Response`].
pub struct ResponseBuilder {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    request: Option<Request>,
    sent_at: SystemTime,
    received_at: SystemTime,
    handshake: Option<Handshake>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
}

impl ResponseBuilder {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            request: None,
            sent_at: SystemTime::UNIX_EPOCH,
            received_at: SystemTime::UNIX_EPOCH,
            handshake: None,
            cache_response: None,
            network_response: None,
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request.without_body());
        self
    }

    pub fn sent_at(mut self, at: SystemTime) -> Self {
        self.sent_at = at;
        self
    }

    pub fn received_at(mut self, at: SystemTime) -> Self {
        self.received_at = at;
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(Box::new);
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(Box::new);
        self
    }

    /// Finish the response. Panics if no request was set; responses are
    /// always built by the engine, which always has one.
    pub fn build(self) -> Response {
        Response {
            status: self.status,
            version: self.version,
            headers: self.headers,
            body: self.body,
            request: self.request.expect("response built without a request"),
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake,
            cache_response: self.cache_response,
            network_response: self.network_response,
        }
    }
}

/// How many bytes `close` will drain looking for EOF before giving up on
/// keeping the source reusable.
const DRAIN_LIMIT: usize = 256 * 1024;

/// How long `close` will spend draining.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// The body of a response.
pub struct ResponseBody {
    kind: BodyKind,
    content_length: Option<u64>,
}

enum BodyKind {
    Empty,
    Buffered(Bytes),
    Streaming(ByteSource),
}

impl ResponseBody {
    /// An empty body.
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            content_length: Some(0),
        }
    }

    /// A body buffered fully in memory.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let content_length = Some(bytes.len() as u64);
        Self {
            kind: BodyKind::Buffered(bytes),
            content_length,
        }
    }

    /// A body streamed from `source`.
    pub fn streaming(source: ByteSource, content_length: Option<u64>) -> Self {
        Self {
            kind: BodyKind::Streaming(source),
            content_length,
        }
    }

    /// The advertised length of this body, if known.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Read the entire body into memory.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        match self.kind {
            BodyKind::Empty => Ok(Bytes::new()),
            BodyKind::Buffered(bytes) => Ok(bytes),
            BodyKind::Streaming(ref mut source) => {
                let mut buf = Vec::with_capacity(
                    self.content_length.unwrap_or(512).min(64 * 1024) as usize,
                );
                source.read_to_end(&mut buf).await?;
                Ok(buf.into())
            }
        }
    }

    /// Close the body without consuming it fully.
    ///
    /// A bounded drain runs first: if EOF is near, reading through to it
    /// lets the underlying exchange complete normally and the connection
    /// stay reusable. Past the bound the source is simply dropped, which
    /// the exchange treats as an abort.
    pub async fn close(mut self) {
        if let BodyKind::Streaming(ref mut source) = self.kind {
            let mut scratch = [0u8; 8 * 1024];
            let mut drained = 0usize;
            let drain = async {
                loop {
                    match source.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            drained += n;
                            if drained >= DRAIN_LIMIT {
                                break;
                            }
                        }
                    }
                }
            };
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
        }
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.kind {
            BodyKind::Empty => Poll::Ready(Ok(())),
            BodyKind::Buffered(bytes) => {
                let n = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes.split_to(n));
                Poll::Ready(Ok(()))
            }
            BodyKind::Streaming(source) => source.as_mut().poll_read(cx, buf),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "Empty",
            BodyKind::Buffered(_) => "Buffered",
            BodyKind::Streaming(_) => "Streaming",
        };
        f.debug_struct("ResponseBody")
            .field("kind", &DebugLiteral(kind))
            .field("content_length", &self.content_length)
            .finish()
    }
}
