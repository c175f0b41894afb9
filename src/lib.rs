//! Courier
//!
//! An HTTP/1.1 and HTTP/2 client call engine built on [tokio].
//!
//! Courier turns a prepared [`Request`] into a [`Response`] by driving it
//! through an ordered stack of interceptors, acquiring (or reusing) a pooled
//! transport connection, and managing the lifecycle of both the call and the
//! connection underneath it. Protocol framing, TLS, and cache storage are
//! injected collaborators - see [`client::conn::codec::Codec`],
//! [`client::conn::TlsFactory`], and [`client::cache::CacheStore`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod body;
pub mod client;
pub mod error;
pub mod request;
pub mod response;

pub use self::body::{DuplexHandle, RequestBody};
pub use self::client::{Builder, Call, Client};
pub use self::error::{Error, ErrorKind};
pub use self::request::Request;
pub use self::response::{Response, ResponseBody};

/// A boxed error, used where collaborators surface arbitrary failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[allow(unused)]
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) mod private {

    #[allow(unused)]
    pub trait Sealed {}
}
