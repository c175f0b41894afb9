//! Prepared requests.

use std::fmt;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri, Version};

use crate::body::RequestBody;
use crate::error::Error;

/// A prepared HTTP request.
///
/// Requests are cheap to clone: the body is shared, not copied, so the retry
/// and follow-up stages can re-issue attempts without duplicating payloads.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl Request {
    /// Start building a request.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// A GET request for `uri` with no body.
    pub fn get(uri: Uri) -> Self {
        Self {
            method: Method::GET,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The HTTP version the request was prepared for.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The first value of `name`, as a string, if present and valid UTF-8.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|value| value.to_str().ok())
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub(crate) fn set_body(&mut self, body: Option<RequestBody>) {
        self.body = body;
    }

    /// Whether this request is addressed over TLS.
    pub fn is_https(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }

    /// This request with the body dropped, for ancestry records and cache
    /// keys.
    pub(crate) fn without_body(&self) -> Request {
        Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body: None,
        }
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    uri: Option<Uri>,
    version: Version,
    headers: HeaderMap,
    body: Option<RequestBody>,
    error: Option<Error>,
}

impl RequestBuilder {
    fn new() -> Self {
        Self {
            method: Method::GET,
            uri: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            error: None,
        }
    }

    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request URI.
    pub fn uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    /// Append a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => {
                self.error = Some(Error::contract(format!("invalid header: {name}")));
            }
        }
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Finish the request.
    pub fn build(self) -> Result<Request, Error> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let uri = self
            .uri
            .ok_or_else(|| Error::contract("request is missing a uri"))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::contract(format!(
                "request uri must be absolute: {uri}"
            )));
        }
        Ok(Request {
            method: self.method,
            uri,
            version: self.version,
            headers: self.headers,
            body: self.body,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_absolute_uri() {
        let err = Request::builder()
            .uri(Uri::from_static("/relative"))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Contract);

        let req = Request::builder()
            .method(Method::POST)
            .uri(Uri::from_static("http://example.com/upload"))
            .header("content-type", "text/plain")
            .body("hi")
            .build()
            .unwrap();
        assert_eq!(req.method(), &Method::POST);
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.body().unwrap().content_length(), Some(2));
    }

    #[test]
    fn clone_shares_body() {
        let req = Request::builder()
            .uri(Uri::from_static("http://example.com/"))
            .body(vec![0u8; 1024])
            .build()
            .unwrap();
        let other = req.clone();
        assert_eq!(
            other.body().unwrap().content_length(),
            req.body().unwrap().content_length()
        );
        assert!(req.without_body().body().is_none());
    }
}
