//! Bridges application requests to network requests.
//!
//! Fills in the headers the wire needs that callers should not have to
//! think about: `Host`, `Connection`, `User-Agent`, the body framing
//! headers, and cookies from the jar. Response cookies are handed back to
//! the jar on the way up.

use async_trait::async_trait;
use http::header::{
    HeaderValue, CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING, USER_AGENT,
};
use http::Uri;

use super::{Chain, Interceptor};
use crate::error::Error;
use crate::response::Response;

/// Source and sink of cookies for requests.
pub trait CookieJar: Send + Sync {
    /// Cookies to attach to a request for `uri`, as `name=value` pairs.
    fn load(&self, uri: &Uri) -> Vec<(String, String)>;

    /// Record cookies from a response for `uri`.
    fn save(&self, uri: &Uri, response: &Response);
}

/// Jar that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCookies {
    _priv: (),
}

impl CookieJar for NoCookies {
    fn load(&self, _uri: &Uri) -> Vec<(String, String)> {
        Vec::new()
    }

    fn save(&self, _uri: &Uri, _response: &Response) {}
}

pub(crate) struct BridgeInterceptor {
    cookie_jar: std::sync::Arc<dyn CookieJar>,
    user_agent: String,
}

impl BridgeInterceptor {
    pub(crate) fn new(cookie_jar: std::sync::Arc<dyn CookieJar>, user_agent: String) -> Self {
        Self {
            cookie_jar,
            user_agent,
        }
    }
}

#[async_trait]
impl Interceptor for BridgeInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error> {
        let mut request = chain.request().clone();
        let uri = request.uri().clone();

        {
            let headers = request.headers_mut();

            if !headers.contains_key(HOST) {
                let host = host_header(&uri)?;
                headers.insert(HOST, host);
            }

            if !headers.contains_key(CONNECTION) {
                headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
            }

            if !headers.contains_key(USER_AGENT) {
                if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
                    headers.insert(USER_AGENT, value);
                }
            }

            let cookies = self.cookie_jar.load(&uri);
            if !cookies.is_empty() && !headers.contains_key(COOKIE) {
                let header = cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                if let Ok(value) = HeaderValue::from_str(&header) {
                    headers.insert(COOKIE, value);
                }
            }
        }

        // Body framing: a known length gets Content-Length, everything
        // else is chunked.
        match request.body().map(|body| body.content_length()) {
            Some(Some(length)) => {
                request
                    .headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(length));
                request.headers_mut().remove(TRANSFER_ENCODING);
            }
            Some(None) => {
                request
                    .headers_mut()
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                request.headers_mut().remove(CONTENT_LENGTH);
            }
            None => {}
        }

        let response = chain.proceed(request).await?;

        self.cookie_jar.save(&uri, &response);

        Ok(response)
    }
}

fn host_header(uri: &Uri) -> Result<HeaderValue, Error> {
    let authority = uri
        .authority()
        .ok_or_else(|| Error::contract("request uri has no authority"))?;
    let host = match (uri.scheme_str(), uri.port_u16()) {
        // Default ports are omitted from the Host header.
        (Some("http"), Some(80)) | (Some("https"), Some(443)) | (_, None) => {
            authority.host().to_owned()
        }
        (_, Some(port)) => format!("{}:{}", authority.host(), port),
    };
    HeaderValue::from_str(&host).map_err(|_| Error::contract("invalid host header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_omits_default_ports() {
        let uri = Uri::from_static("http://example.com:80/index");
        assert_eq!(host_header(&uri).unwrap(), "example.com");

        let uri = Uri::from_static("https://example.com:8443/");
        assert_eq!(host_header(&uri).unwrap(), "example.com:8443");

        let uri = Uri::from_static("http://example.com/");
        assert_eq!(host_header(&uri).unwrap(), "example.com");
    }
}
