//! DNS resolution.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use async_trait::async_trait;

/// Resolves a hostname to an ordered list of socket addresses.
#[async_trait]
pub trait Dns: Send + Sync {
    /// Resolve `host` for `port`. The returned order is the order dial
    /// attempts will be made in.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// GetAddrInfo based resolver.
///
/// Uses the `getaddrinfo` system call on a blocking worker thread to
/// resolve hostnames via the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait]
impl Dns for GaiResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let span = tracing::Span::current();
        let handle = tokio::task::spawn_blocking(move || {
            tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
                tracing::trace!("dns resolution starting");
                (host.as_str(), port)
                    .to_socket_addrs()
                    .map(|addrs| addrs.collect::<Vec<_>>())
            })
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, join_err))
            }
            Err(join_err) => Err(io::Error::other(join_err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_localhost() {
        let resolver = GaiResolver::new();
        let addrs = resolver.resolve("localhost", 8080).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 8080));
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let resolver = GaiResolver::new();
        let addrs = resolver.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);

        let addrs = resolver.resolve("[::1]", 443).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
    }
}
