//! Mock collaborators for testing.
//!
//! The mock codec speaks no bytes: exchanges are scripted ahead of time on
//! a [`MockCodecFactory`] and replayed in order, while every request that
//! reaches the wire is recorded for assertions. Sockets come from an
//! in-memory duplex pair and are never read.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use parking_lot::Mutex;

use super::codec::{Codec, CodecHost};
use super::dns::Dns;
use super::route::Route;
use super::{
    Address, BoxedSocket, CodecFactory, Connection, Handshake, HttpProtocol, SocketFactory,
    TlsConfig, TlsFactory,
};
use crate::body::{ByteSink, ByteSource};
use crate::client::cache::{has_vary_all, CacheStore, CacheStrategy, CacheWriteHandle};
use crate::client::events::EventListener;
use crate::error::{Error, ErrorKind};
use crate::request::Request;
use crate::response::{Response, ResponseBody, ResponseHead};

/// DNS resolver with a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticDns {
    addrs: Vec<SocketAddr>,
}

impl StaticDns {
    pub fn new(addrs: &[&str]) -> Self {
        Self {
            addrs: addrs.iter().map(|addr| addr.parse().unwrap()).collect(),
        }
    }
}

#[async_trait]
impl Dns for StaticDns {
    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(self.addrs.clone())
    }
}

/// Socket factory producing in-memory streams that nothing reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockSocketFactory {
    _priv: (),
}

#[async_trait]
impl SocketFactory for MockSocketFactory {
    async fn connect(&self, _route: &Route) -> io::Result<BoxedSocket> {
        let (local, _remote) = tokio::io::duplex(64);
        Ok(Box::new(local))
    }
}

/// TLS factory that fabricates a handshake without touching the socket.
#[derive(Debug, Clone)]
pub struct MockTlsFactory {
    pub protocol: HttpProtocol,
    pub peer_hosts: Vec<String>,
}

#[async_trait]
impl TlsFactory for MockTlsFactory {
    async fn upgrade(
        &self,
        socket: BoxedSocket,
        _host: &str,
        _protocols: &[HttpProtocol],
    ) -> Result<(BoxedSocket, Handshake), Error> {
        Ok((
            socket,
            Handshake {
                protocol: self.protocol,
                peer_hosts: self.peer_hosts.clone(),
                cipher_suite: Some("TLS_MOCK_SUITE".to_owned()),
            },
        ))
    }
}

/// An address over the mock collaborators, resolving to `addrs`.
pub fn mock_address(host: &str, port: u16, addrs: &[&str]) -> Address {
    Address::new(
        host,
        port,
        Arc::new(StaticDns::new(addrs)),
        Arc::new(MockSocketFactory::default()),
        None,
        None,
        vec![HttpProtocol::Http1],
    )
}

/// A TLS address plus a live multiplexed connection whose certificate
/// covers `peer_hosts`. The connection's route uses the first of `addrs`.
pub fn mock_tls_address(
    host: &str,
    addrs: &[&str],
    peer_hosts: &[&str],
) -> (Address, Arc<Connection>) {
    let peer_hosts: Vec<String> = peer_hosts.iter().map(|peer| peer.to_string()).collect();
    let tls = TlsConfig::new(Arc::new(MockTlsFactory {
        protocol: HttpProtocol::Http2,
        peer_hosts: peer_hosts.clone(),
    }));
    let address = Address::new(
        host,
        443,
        Arc::new(StaticDns::new(addrs)),
        Arc::new(MockSocketFactory::default()),
        Some(tls),
        None,
        vec![HttpProtocol::Http2, HttpProtocol::Http1],
    );
    let route = Route::new(address.clone(), None, addrs[0].parse().unwrap());
    let connection = Connection::new(
        route,
        HttpProtocol::Http2,
        Some(Handshake {
            protocol: HttpProtocol::Http2,
            peer_hosts,
            cipher_suite: None,
        }),
        Box::new(MockCodecHost::empty(true)),
    );
    (address, connection)
}

/// A connection to `address` over an empty mock codec host.
pub fn mock_connection(address: &Address, protocol: HttpProtocol) -> Arc<Connection> {
    let socket_addr: SocketAddr = SocketAddr::from(([10, 0, 0, 1], address.port()));
    let route = Route::new(address.clone(), address.proxy().cloned(), socket_addr);
    Connection::new(
        route,
        protocol,
        None,
        Box::new(MockCodecHost::empty(protocol.is_multiplexed())),
    )
}

/// One scripted request/response turn.
pub struct MockExchange {
    responses: VecDeque<ResponseHead>,
    continue_response: Option<ResponseHead>,
    body: Bytes,
    hang_body_after: Option<usize>,
    fail_send: Option<ErrorKind>,
}

impl MockExchange {
    /// An exchange answering with `status` and no body.
    pub fn reply(status: u16) -> Self {
        Self {
            responses: VecDeque::from([head(status, Version::HTTP_11, &[])]),
            continue_response: None,
            body: Bytes::new(),
            hang_body_after: None,
            fail_send: None,
        }
    }

    /// Add a response header to the (last) scripted head.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let head = self.responses.back_mut().expect("scripted response");
        head.headers.append(
            name.parse::<http::header::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    /// Set the response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Script an interim head before the final one (e.g. a literal 100).
    pub fn interim(mut self, status: u16) -> Self {
        self.responses.push_front(head(status, Version::HTTP_11, &[]));
        self
    }

    /// Answer an `Expect: 100-continue` request early with this status,
    /// before any body is transmitted.
    pub fn early_reply(mut self, status: u16) -> Self {
        self.continue_response = Some(head(status, Version::HTTP_11, &[]));
        self
    }

    /// Serve `n` body bytes, then stall until the exchange is canceled.
    pub fn hang_body_after(mut self, n: usize) -> Self {
        self.hang_body_after = Some(n);
        self
    }

    /// Fail when the request headers are written.
    pub fn fail_send(mut self, kind: ErrorKind) -> Self {
        self.fail_send = Some(kind);
        self
    }
}

fn head(status: u16, version: Version, headers: &[(&str, &str)]) -> ResponseHead {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            name.parse::<http::header::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ResponseHead {
        status: StatusCode::from_u16(status).unwrap(),
        version,
        headers: map,
    }
}

/// What a mock codec saw of one request.
#[derive(Debug, Clone, Default)]
pub struct RecordedRequest {
    pub method: Option<Method>,
    pub uri: Option<Uri>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub body_complete: bool,
    pub finished: bool,
}

/// Codec factory replaying scripted exchanges in order, shared across all
/// connections it creates.
pub struct MockCodecFactory {
    scripts: Arc<Mutex<VecDeque<MockExchange>>>,
    recorded: Arc<Mutex<Vec<Arc<Mutex<RecordedRequest>>>>>,
    connections: AtomicUsize,
    multiplexed: bool,
}

impl MockCodecFactory {
    /// A factory creating HTTP/1 connections.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            recorded: Arc::new(Mutex::new(Vec::new())),
            connections: AtomicUsize::new(0),
            multiplexed: false,
        })
    }

    /// A factory creating multiplexed (HTTP/2) connections.
    pub fn http2() -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            recorded: Arc::new(Mutex::new(Vec::new())),
            connections: AtomicUsize::new(0),
            multiplexed: true,
        })
    }

    /// Script the next exchange.
    pub fn enqueue(&self, exchange: MockExchange) {
        self.scripts.lock().push_back(exchange);
    }

    /// Requests seen so far, in order.
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded
            .lock()
            .iter()
            .map(|entry| entry.lock().clone())
            .collect()
    }

    /// How many connections have been created.
    pub fn connections_created(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

impl CodecFactory for MockCodecFactory {
    fn create(
        &self,
        _socket: BoxedSocket,
        protocol: HttpProtocol,
    ) -> Result<Box<dyn CodecHost>, Error> {
        self.connections.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockCodecHost {
            scripts: self.scripts.clone(),
            recorded: self.recorded.clone(),
            multiplexed: self.multiplexed || protocol.is_multiplexed(),
            closed: Arc::new(AtomicBool::new(false)),
            wakers: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

pub struct MockCodecHost {
    scripts: Arc<Mutex<VecDeque<MockExchange>>>,
    recorded: Arc<Mutex<Vec<Arc<Mutex<RecordedRequest>>>>>,
    multiplexed: bool,
    closed: Arc<AtomicBool>,
    wakers: Arc<Mutex<Vec<Waker>>>,
}

impl MockCodecHost {
    fn empty(multiplexed: bool) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            recorded: Arc::new(Mutex::new(Vec::new())),
            multiplexed,
            closed: Arc::new(AtomicBool::new(false)),
            wakers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CodecHost for MockCodecHost {
    fn new_codec(&self) -> Result<Box<dyn Codec>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::shutdown());
        }
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| Error::transport(io::Error::other("no scripted exchange left")))?;
        let recorded = Arc::new(Mutex::new(RecordedRequest::default()));
        self.recorded.lock().push(recorded.clone());
        Ok(Box::new(MockCodec {
            script: Mutex::new(script),
            recorded,
            multiplexed: self.multiplexed,
            host_closed: self.closed.clone(),
            codec_canceled: Arc::new(AtomicBool::new(false)),
            wakers: self.wakers.clone(),
        }))
    }

    fn is_healthy(&self, _idle: bool) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
    }
}

struct MockCodec {
    script: Mutex<MockExchange>,
    recorded: Arc<Mutex<RecordedRequest>>,
    multiplexed: bool,
    /// Shared with the host: set when the whole connection closes.
    host_closed: Arc<AtomicBool>,
    /// Set when only this exchange is canceled.
    codec_canceled: Arc<AtomicBool>,
    wakers: Arc<Mutex<Vec<Waker>>>,
}

impl MockCodec {
    fn is_canceled(&self) -> bool {
        self.host_closed.load(Ordering::Acquire) || self.codec_canceled.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_canceled() {
            Err(Error::transport(io::Error::other("exchange canceled")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Codec for MockCodec {
    async fn write_request_headers(&self, request: &Request) -> Result<(), Error> {
        self.check_open()?;
        if let Some(kind) = self.script.lock().fail_send.take() {
            return Err(match kind {
                ErrorKind::ConnectionShutdown => Error::shutdown(),
                _ => Error::transport(io::Error::other("scripted send failure")),
            });
        }
        let mut recorded = self.recorded.lock();
        recorded.method = Some(request.method().clone());
        recorded.uri = Some(request.uri().clone());
        recorded.headers = request.headers().clone();
        Ok(())
    }

    async fn flush_request(&self) -> Result<(), Error> {
        self.check_open()
    }

    fn create_request_body(&self, _request: &Request, _duplex: bool) -> Result<ByteSink, Error> {
        self.check_open()?;
        Ok(Box::pin(MockSink {
            recorded: self.recorded.clone(),
        }))
    }

    async fn finish_request(&self) -> Result<(), Error> {
        self.check_open()?;
        self.recorded.lock().finished = true;
        Ok(())
    }

    async fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseHead>, Error> {
        self.check_open()?;
        let mut script = self.script.lock();
        if expect_continue {
            return Ok(script.continue_response.take());
        }
        Ok(script.responses.pop_front())
    }

    fn open_response_body(&self, _response: &ResponseHead) -> Result<ByteSource, Error> {
        self.check_open()?;
        let script = self.script.lock();
        Ok(Box::pin(MockSource {
            data: script.body.clone(),
            pos: 0,
            hang_after: script.hang_body_after,
            host_closed: self.host_closed.clone(),
            codec_canceled: self.codec_canceled.clone(),
            wakers: self.wakers.clone(),
        }))
    }

    fn cancel(&self) {
        self.codec_canceled.store(true, Ordering::Release);
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
    }

    fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }
}

struct MockSink {
    recorded: Arc<Mutex<RecordedRequest>>,
}

impl tokio::io::AsyncWrite for MockSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.recorded.lock().body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.recorded.lock().body_complete = true;
        Poll::Ready(Ok(()))
    }
}

struct MockSource {
    data: Bytes,
    pos: usize,
    hang_after: Option<usize>,
    host_closed: Arc<AtomicBool>,
    codec_canceled: Arc<AtomicBool>,
    wakers: Arc<Mutex<Vec<Waker>>>,
}

impl tokio::io::AsyncRead for MockSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.host_closed.load(Ordering::Acquire) || this.codec_canceled.load(Ordering::Acquire)
        {
            return Poll::Ready(Err(io::Error::other("stream canceled")));
        }

        let remaining = this.data.len() - this.pos;
        if remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(hang) = this.hang_after {
            if this.pos >= hang {
                this.wakers.lock().push(cx.waker().clone());
                return Poll::Pending;
            }
            let n = remaining.min(buf.remaining()).min(hang - this.pos);
            buf.put_slice(&this.data[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        let n = remaining.min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Event listener that records event names in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().push(event);
    }
}

impl EventListener for RecordingListener {
    fn call_start(&self) {
        self.record("call_start");
    }
    fn call_end(&self) {
        self.record("call_end");
    }
    fn call_failed(&self, _error: &Error) {
        self.record("call_failed");
    }
    fn canceled(&self) {
        self.record("canceled");
    }
    fn connection_released(&self) {
        self.record("connection_released");
    }
    fn cache_hit(&self) {
        self.record("cache_hit");
    }
    fn cache_miss(&self) {
        self.record("cache_miss");
    }
    fn cache_conditional_hit(&self) {
        self.record("cache_conditional_hit");
    }
    fn satisfaction_failure(&self) {
        self.record("satisfaction_failure");
    }
    fn response_headers_start(&self) {
        self.record("response_headers_start");
    }
    fn response_headers_end(&self, _response: &Response) {
        self.record("response_headers_end");
    }
}

struct StoredEntry {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    sent_at: SystemTime,
    received_at: SystemTime,
    handshake: Option<Handshake>,
    method: Method,
    uri: Uri,
    /// Headers of the request this response was stored under. The engine
    /// matches `Vary` against these.
    request_headers: HeaderMap,
}

/// An in-memory [`CacheStore`] with `Vary` awareness.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    puts: AtomicUsize,
    hits: AtomicUsize,
    conditional_hits: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Acquire)
    }

    pub fn conditional_hit_count(&self) -> usize {
        self.conditional_hits.load(Ordering::Acquire)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Acquire)
    }

    fn key(uri: &Uri) -> String {
        uri.to_string()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, request: &Request) -> Option<Response> {
        let entries = self.entries.lock();
        let entry = entries.get(&Self::key(request.uri()))?;

        // The stored request's headers ride along; the engine runs the
        // `Vary` match against them.
        let mut rebuilt_request = Request::builder()
            .method(entry.method.clone())
            .uri(entry.uri.clone())
            .build()
            .ok()?;
        *rebuilt_request.headers_mut() = entry.request_headers.clone();

        Some(
            Response::builder()
                .status(entry.status)
                .version(entry.version)
                .headers(entry.headers.clone())
                .request(rebuilt_request)
                .sent_at(entry.sent_at)
                .received_at(entry.received_at)
                .handshake(entry.handshake.clone())
                .body(ResponseBody::bytes(entry.body.clone()))
                .build(),
        )
    }

    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriteHandle>> {
        // The engine refuses `Vary: *` before calling put; decline all the
        // same if one arrives.
        if has_vary_all(response.headers()) {
            return None;
        }

        self.puts.fetch_add(1, Ordering::AcqRel);
        Some(Box::new(MemoryWriteHandle {
            entries: self.entries.clone(),
            key: Self::key(response.request().uri()),
            entry: Some(StoredEntry {
                status: response.status(),
                version: response.version(),
                headers: response.headers().clone(),
                body: Bytes::new(),
                sent_at: response.sent_at(),
                received_at: response.received_at(),
                handshake: response.handshake().cloned(),
                method: response.request().method().clone(),
                uri: response.request().uri().clone(),
                request_headers: response.request().headers().clone(),
            }),
            buffer: Vec::new(),
        }))
    }

    fn remove(&self, request: &Request) {
        self.entries.lock().remove(&Self::key(request.uri()));
    }

    fn update(&self, cached: &Response, network: &Response) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&Self::key(cached.request().uri())) {
            entry.headers = network.headers().clone();
            entry.sent_at = network.sent_at();
            entry.received_at = network.received_at();
        }
    }

    fn track_response(&self, strategy: &CacheStrategy) {
        if strategy.network_request.is_none() && strategy.cache_response.is_some() {
            self.hits.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn track_conditional_hit(&self) {
        self.conditional_hits.fetch_add(1, Ordering::AcqRel);
    }
}

struct MemoryWriteHandle {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    key: String,
    entry: Option<StoredEntry>,
    buffer: Vec<u8>,
}

impl CacheWriteHandle for MemoryWriteHandle {
    fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn commit(mut self: Box<Self>) {
        if let Some(mut entry) = self.entry.take() {
            entry.body = Bytes::from(std::mem::take(&mut self.buffer));
            self.entries.lock().insert(self.key.clone(), entry);
        }
    }

    fn abort(mut self: Box<Self>) {
        self.entry.take();
    }
}
