//! Request body representations and the byte-stream aliases used at the
//! codec boundary.
//!
//! A request body must be replayable so the retry stage can re-send it on a
//! fresh connection: buffered bodies replay trivially, streaming bodies
//! replay by invoking their writer again, and duplex bodies cannot replay
//! at all (the application drives the sink after response headers arrive).

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

/// A writable byte stream handed out by a codec for the request body.
pub type ByteSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A readable byte stream handed out by a codec for the response body.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// Produces the bytes of a streaming request body.
///
/// `write_to` may be invoked more than once: each call attempt replays the
/// body from the start.
pub trait WriteBody: Send + Sync {
    /// Write the body to the sink. The sink is flushed and shut down by the
    /// caller.
    fn write_to<'a>(&'a self, sink: &'a mut ByteSink) -> BoxFuture<'a, io::Result<()>>;
}

/// The body of a request.
#[derive(Clone)]
pub struct RequestBody {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Bytes(Bytes),
    Stream {
        length: Option<u64>,
        writer: Arc<dyn WriteBody>,
    },
    Duplex(Arc<Mutex<Option<oneshot::Sender<ByteSink>>>>),
}

/// The application's end of a duplex request body: resolves to the
/// writable sink once the exchange has sent the request headers.
pub struct DuplexHandle {
    rx: oneshot::Receiver<ByteSink>,
}

impl DuplexHandle {
    /// Wait for the request sink. Closing (shutting down) the sink is what
    /// finishes the request; the response may arrive before, during, or
    /// after writing.
    pub async fn sink(self) -> io::Result<ByteSink> {
        self.rx
            .await
            .map_err(|_| io::Error::other("call ended before the duplex sink was opened"))
    }
}

impl fmt::Debug for DuplexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexHandle").finish()
    }
}

impl RequestBody {
    /// A body buffered fully in memory.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Bytes(bytes.into()),
        }
    }

    /// A streaming body produced by `writer`, with an optional known length.
    pub fn streaming(length: Option<u64>, writer: Arc<dyn WriteBody>) -> Self {
        Self {
            kind: Kind::Stream { length, writer },
        }
    }

    /// A duplex body: the application writes the request sink concurrently
    /// with (or after) reading the response, via the returned handle.
    pub fn duplex() -> (Self, DuplexHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind: Kind::Duplex(Arc::new(Mutex::new(Some(tx)))),
            },
            DuplexHandle { rx },
        )
    }

    /// Hand the exchange's sink to the application side of a duplex body.
    /// If the handle was dropped, the sink is dropped too, aborting the
    /// exchange's request half.
    pub(crate) fn send_duplex_sink(&self, sink: ByteSink) {
        if let Kind::Duplex(slot) = &self.kind {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(sink);
            }
        }
    }

    /// The number of bytes this body will write, if known up front.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            Kind::Bytes(bytes) => Some(bytes.len() as u64),
            Kind::Stream { length, .. } => *length,
            Kind::Duplex(_) => None,
        }
    }

    /// Whether this body is written by the application after the exchange
    /// has started.
    pub fn is_duplex(&self) -> bool {
        matches!(self.kind, Kind::Duplex(_))
    }

    /// Whether the body can be written again on a retry attempt.
    pub fn is_replayable(&self) -> bool {
        !self.is_duplex()
    }

    /// Write this body to `sink`. Not used for duplex bodies, whose sink is
    /// handed to the application instead.
    pub(crate) async fn write_to(&self, sink: &mut ByteSink) -> io::Result<()> {
        match &self.kind {
            Kind::Bytes(bytes) => sink.write_all(bytes).await,
            Kind::Stream { writer, .. } => writer.write_to(sink).await,
            Kind::Duplex(_) => Err(io::Error::other("duplex body cannot be written eagerly")),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Kind::Stream { length, .. } => f.debug_tuple("Stream").field(length).finish(),
            Kind::Duplex(_) => f.debug_tuple("Duplex").finish(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Self::bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::bytes(Bytes::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_body_replays() {
        let body = RequestBody::bytes("hello");
        assert_eq!(body.content_length(), Some(5));
        assert!(body.is_replayable());

        for _ in 0..2 {
            let mut out: ByteSink = Box::pin(Vec::new());
            body.write_to(&mut out).await.unwrap();
        }
    }

    #[tokio::test]
    async fn duplex_body_has_no_length() {
        let (body, _handle) = RequestBody::duplex();
        assert_eq!(body.content_length(), None);
        assert!(body.is_duplex());
        assert!(!body.is_replayable());

        let mut out: ByteSink = Box::pin(Vec::new());
        assert!(body.write_to(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn duplex_handle_receives_sink() {
        let (body, handle) = RequestBody::duplex();
        body.send_duplex_sink(Box::pin(Vec::new()));
        let mut sink = handle.sink().await.unwrap();
        sink.write_all(b"late bytes").await.unwrap();
    }

    #[test]
    fn debug_does_not_leak_contents() {
        let body = RequestBody::bytes("secret");
        assert_eq!(format!("{body:?}"), "Bytes(6)");
    }
}
