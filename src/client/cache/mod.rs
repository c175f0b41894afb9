//! The response cache stage.
//!
//! Storage is external (the [`CacheStore`] trait); this module owns the
//! policy: when to serve from cache, when to revalidate conditionally, how
//! to merge headers on a 304, and how to stream a network body into the
//! store while the caller consumes it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, WARNING};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace};

pub(crate) mod strategy;

pub use strategy::{has_vary_all, vary_matches, CacheControl, CacheStrategy};

use super::events::EventListener;
use super::interceptor::{Chain, Interceptor};
use crate::body::ByteSource;
use crate::error::Error;
use crate::request::Request;
use crate::response::{Response, ResponseBody};

use self::strategy::{invalidates_cache, is_cacheable};

/// Storage backing the cache stage.
///
/// Responses handed to `put` carry their head only; the body streams into
/// the returned write handle as the caller reads it. `Vary` policy is the
/// engine's: stores keep the headers of the request a response was stored
/// under (on [`Response::request`]), and the engine runs [`vary_matches`]
/// against every candidate `get` returns. `put` is never invoked for a
/// `Vary: *` response.
pub trait CacheStore: Send + Sync {
    /// The stored response for `request`'s URL, if any, carrying the
    /// stored request's headers. The body must be buffered (replayable).
    fn get(&self, request: &Request) -> Option<Response>;

    /// Begin storing `response`. `None` declines (e.g. non-cacheable by
    /// store policy).
    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriteHandle>>;

    /// Drop the entry for `request`.
    fn remove(&self, request: &Request);

    /// Replace the stored `cached` entry's metadata with `network`'s
    /// (headers merged by the caller; body unchanged).
    fn update(&self, cached: &Response, network: &Response);

    /// A strategy was computed; for hit/miss accounting.
    fn track_response(&self, _strategy: &CacheStrategy) {}

    /// A conditional request was answered 304.
    fn track_conditional_hit(&self) {}
}

/// An in-progress cache write.
pub trait CacheWriteHandle: Send {
    /// Append body bytes.
    fn write(&mut self, chunk: &[u8]);

    /// The body is complete; publish the entry.
    fn commit(self: Box<Self>);

    /// The body is incomplete; discard the entry.
    fn abort(self: Box<Self>);
}

pub(crate) struct CacheInterceptor {
    store: Option<Arc<dyn CacheStore>>,
    events: Arc<dyn EventListener>,
}

impl CacheInterceptor {
    pub(crate) fn new(store: Option<Arc<dyn CacheStore>>, events: Arc<dyn EventListener>) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl Interceptor for CacheInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error> {
        let request = chain.request().clone();
        // A stored response whose vary key does not match this request is
        // a miss.
        let candidate = self
            .store
            .as_ref()
            .and_then(|store| store.get(&request))
            .filter(|cached| vary_matches(cached, &request));
        let now = SystemTime::now();

        let strategy = CacheStrategy::compute(now, &request, candidate);
        if let Some(store) = &self.store {
            store.track_response(&strategy);
        }

        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;

        let Some(network_request) = network_request else {
            return match cache_response {
                // Required to be cached, and it isn't: a synthesized
                // failure, not an error.
                None => {
                    debug!(%request, "unsatisfiable only-if-cached request");
                    self.events.satisfaction_failure();
                    Ok(Response::builder()
                        .status(StatusCode::GATEWAY_TIMEOUT)
                        .request(request)
                        .sent_at(now)
                        .received_at(now)
                        .body(ResponseBody::empty())
                        .build())
                }
                Some(cached) => {
                    trace!(%request, "cache hit");
                    self.events.cache_hit();
                    let stripped = cached.strip_body();
                    Ok(cached.into_builder().cache_response(Some(stripped)).build())
                }
            };
        };

        if cache_response.is_some() {
            self.events.cache_conditional_hit();
        } else if self.store.is_some() {
            self.events.cache_miss();
        }

        let network_response = match chain.proceed(network_request).await {
            Ok(response) => response,
            Err(error) => {
                // The candidate body is not leaked on a network failure.
                drop(cache_response);
                return Err(error);
            }
        };

        if let Some(cached) = cache_response {
            if network_response.status() == StatusCode::NOT_MODIFIED {
                trace!(%request, "conditional cache hit");
                let merged = combine_headers(cached.headers(), network_response.headers());
                let stripped_cache = cached.strip_body();
                let stripped_network = network_response.strip_body();
                let sent_at = network_response.sent_at();
                let received_at = network_response.received_at();

                // A 304 has no body, but its stream still has to reach EOF
                // for the exchange to complete and the connection to stay
                // reusable.
                if let Some(body) = network_response.into_body() {
                    body.close().await;
                }

                let response = cached
                    .into_builder()
                    .headers(merged)
                    .sent_at(sent_at)
                    .received_at(received_at)
                    .cache_response(Some(stripped_cache.strip_body()))
                    .network_response(Some(stripped_network))
                    .build();

                if let Some(store) = &self.store {
                    store.track_conditional_hit();
                    store.update(&stripped_cache, &response);
                }
                self.events.cache_hit();
                return Ok(response);
            }

            // The entry lost validation; its body is closed here and the
            // network response supersedes it.
            drop(cached);
        }

        let mut response = network_response;

        if let Some(store) = &self.store {
            if invalidates_cache(request.method()) {
                if response.is_success() {
                    store.remove(&request);
                }
            } else if *request.method() == Method::GET && is_cacheable(&response, &request) {
                if let Some(handle) = store.put(&response) {
                    response = cache_writing_response(response, handle);
                }
            }
        }

        Ok(response)
    }
}

/// Combine headers for a 304 per RFC 7234 §4.3.4: end-to-end headers are
/// refreshed from the network; content-specific headers stay with the
/// cached entity; 100-level warnings are dropped from the cached set.
fn combine_headers(cached: &HeaderMap, network: &HeaderMap) -> HeaderMap {
    let mut combined = HeaderMap::new();

    for (name, value) in cached {
        if *name == WARNING {
            if let Ok(text) = value.to_str() {
                if text.starts_with('1') {
                    continue;
                }
            }
        }
        if is_content_specific(name) || !is_end_to_end(name) || !network.contains_key(name) {
            combined.append(name.clone(), value.clone());
        }
    }

    for (name, value) in network {
        if !is_content_specific(name) && is_end_to_end(name) {
            combined.append(name.clone(), value.clone());
        }
    }

    combined
}

fn is_content_specific(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length" | "content-encoding" | "content-type"
    )
}

/// RFC 7234 hop-by-hop exclusions.
fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Replace the response body with one that tees every read into the cache
/// write handle, committing on EOF.
fn cache_writing_response(mut response: Response, handle: Box<dyn CacheWriteHandle>) -> Response {
    match response.body_mut().take() {
        Some(body) => {
            let content_length = body.content_length();
            let source: ByteSource = Box::pin(CacheWritingSource {
                inner: body,
                handle: Some(handle),
            });
            *response.body_mut() = Some(ResponseBody::streaming(source, content_length));
            response
        }
        None => {
            handle.abort();
            response
        }
    }
}

struct CacheWritingSource {
    inner: ResponseBody,
    handle: Option<Box<dyn CacheWriteHandle>>,
}

impl AsyncRead for CacheWritingSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                if filled.len() == before {
                    if let Some(handle) = this.handle.take() {
                        handle.commit();
                    }
                } else if let Some(handle) = this.handle.as_mut() {
                    handle.write(&filled[before..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                if let Some(handle) = this.handle.take() {
                    handle.abort();
                }
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CacheWritingSource {
    fn drop(&mut self) {
        // Closed before EOF: the entry would be truncated.
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn combine_refreshes_end_to_end_headers() {
        let cached = headers(&[
            ("content-type", "text/plain"),
            ("cache-control", "max-age=60"),
            ("x-entity", "kept"),
        ]);
        let network = headers(&[
            ("cache-control", "max-age=120"),
            ("x-fresh", "added"),
        ]);

        let combined = combine_headers(&cached, &network);
        assert_eq!(combined.get("cache-control").unwrap(), "max-age=120");
        assert_eq!(combined.get("content-type").unwrap(), "text/plain");
        assert_eq!(combined.get("x-entity").unwrap(), "kept");
        assert_eq!(combined.get("x-fresh").unwrap(), "added");
    }

    #[test]
    fn combine_keeps_cached_content_headers() {
        let cached = headers(&[("content-length", "5"), ("content-encoding", "gzip")]);
        let network = headers(&[("content-length", "0"), ("content-type", "text/new")]);

        let combined = combine_headers(&cached, &network);
        assert_eq!(combined.get("content-length").unwrap(), "5");
        assert_eq!(combined.get("content-encoding").unwrap(), "gzip");
        // Content-specific network headers are not taken.
        assert!(combined.get("content-type").is_none());
    }

    #[test]
    fn combine_drops_hop_by_hop_and_stale_warnings() {
        let cached = headers(&[
            ("warning", "110 - \"stale\""),
            ("warning", "299 - \"permanent\""),
            ("connection", "keep-alive"),
        ]);
        let network = headers(&[("transfer-encoding", "chunked")]);

        let combined = combine_headers(&cached, &network);
        let warnings: Vec<_> = combined
            .get_all("warning")
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(warnings, vec!["299 - \"permanent\""]);
        // Cached hop-by-hop values ride along; network hop-by-hop values
        // are never taken.
        assert!(combined.get("connection").is_some());
        assert!(combined.get("transfer-encoding").is_none());
    }
}
