//! The terminal stage: drives the wire exchange.

use std::time::SystemTime;

use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::{Chain, Interceptor};
use crate::error::{Error, ErrorKind};
use crate::request::Request;
use crate::response::{Response, ResponseBody, ResponseHead};

pub(crate) struct CallServerInterceptor {
    web_socket: bool,
}

impl CallServerInterceptor {
    pub(crate) fn new(web_socket: bool) -> Self {
        Self { web_socket }
    }
}

#[async_trait]
impl Interceptor for CallServerInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error> {
        let exchange = chain
            .exchange()
            .cloned()
            .ok_or_else(|| Error::contract("terminal stage reached without an exchange"))?;
        let events = chain.call_inner().client.events.clone();
        let request = chain.request().clone();
        let sent_at = SystemTime::now();

        let mut early_head: Option<ResponseHead> = None;
        let mut send_error: Option<Error> = None;

        // Send the request. A transmit failure is retained rather than
        // surfaced immediately: if reading a response also fails, the read
        // error wins with the transmit error attached; the transmit error
        // itself wins only when the read succeeds.
        let send_result: Result<(), Error> = async {
            exchange.write_request_headers(&request).await?;

            if permits_request_body(request.method()) && request.body().is_some() {
                let body = request.body().expect("checked above").clone();

                if expects_continue(&request) {
                    exchange.flush_request().await?;
                    match exchange.read_response_headers(true).await? {
                        Some(head) => {
                            // The server answered before the body: that
                            // response is final and the body is never
                            // sent. An HTTP/1 connection is now partially
                            // consumed and cannot be reused.
                            trace!(status = %head.status, "expectation not met");
                            exchange.no_request_body();
                            if !exchange.connection().is_multiplexed() {
                                exchange.no_new_exchanges_on_connection();
                            }
                            early_head = Some(head);
                        }
                        None => {
                            write_request_body(&exchange, &request, &body).await?;
                        }
                    }
                } else {
                    write_request_body(&exchange, &request, &body).await?;
                }

                if early_head.is_none() && !body.is_duplex() {
                    exchange.finish_request().await?;
                }
            } else {
                exchange.no_request_body();
                exchange.finish_request().await?;
            }

            Ok(())
        }
        .await;

        match send_result {
            // No bytes of the request were transmitted: rethrown unchanged
            // so the retry stage may transparently re-attempt.
            Err(error) if error.kind() == ErrorKind::ConnectionShutdown => return Err(error),
            Err(error) => send_error = Some(error),
            Ok(()) => {
                // A duplex call's lifetime is application-driven from here
                // on; the call timeout no longer applies.
                if early_head.is_none()
                    && request
                        .body()
                        .map(|body| body.is_duplex())
                        .unwrap_or(false)
                {
                    chain.call_inner().timeout_early_exit();
                }
            }
        }

        events.response_headers_start();
        let mut head = match early_head {
            Some(head) => head,
            None => match exchange.read_response_headers(false).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    let error = Error::protocol("connection closed before response headers");
                    return Err(attach_send_error(error, send_error));
                }
                Err(error) => return Err(attach_send_error(error, send_error)),
            },
        };

        if let Some(error) = send_error {
            return Err(error);
        }

        // An interim 100 without Expect is discarded, exactly once.
        if head.status == StatusCode::CONTINUE {
            head = match exchange.read_response_headers(false).await? {
                Some(head) => head,
                None => {
                    return Err(Error::protocol(
                        "connection closed after an interim 100 response",
                    ))
                }
            };
        }

        let received_at = SystemTime::now();
        let status = head.status;

        let body = if status == StatusCode::SWITCHING_PROTOCOLS && self.web_socket {
            // The socket belongs to the WebSocket now; this exchange is
            // complete and the connection leaves circulation.
            exchange.no_response_body();
            exchange.no_new_exchanges_on_connection();
            ResponseBody::empty()
        } else {
            exchange.open_response_body(&head)?
        };

        let response = Response::builder()
            .status(head.status)
            .version(head.version)
            .headers(head.headers)
            .request(request.clone())
            .sent_at(sent_at)
            .received_at(received_at)
            .handshake(exchange.connection().handshake().cloned())
            .body(body)
            .build();

        events.response_headers_end(&response);

        if wants_close(request.headers()) || wants_close(response.headers()) {
            exchange.no_new_exchanges_on_connection();
        }

        if matches!(status.as_u16(), 204 | 205) {
            if let Some(length) = declared_length(response.headers()) {
                if length > 0 {
                    exchange.no_new_exchanges_on_connection();
                    return Err(Error::protocol(format!(
                        "HTTP {} had Content-Length: {length}",
                        status.as_u16()
                    )));
                }
            }
        }

        Ok(response)
    }
}

async fn write_request_body(
    exchange: &std::sync::Arc<crate::client::conn::exchange::Exchange>,
    request: &Request,
    body: &crate::body::RequestBody,
) -> Result<(), Error> {
    if body.is_duplex() {
        // Flush headers, then hand the writable sink to the application;
        // closing the sink is what finishes the request.
        exchange.flush_request().await?;
        let sink = exchange.create_request_body(request, true)?;
        body.send_duplex_sink(sink);
        Ok(())
    } else {
        let mut sink = exchange.create_request_body(request, false)?;
        body.write_to(&mut sink).await.map_err(Error::transport)?;
        sink.shutdown().await.map_err(Error::transport)?;
        Ok(())
    }
}

fn attach_send_error(read_error: Error, send_error: Option<Error>) -> Error {
    match send_error {
        Some(send_error) => read_error.with_suppressed(send_error),
        None => read_error,
    }
}

fn permits_request_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

fn expects_continue(request: &Request) -> bool {
    request
        .headers()
        .get(EXPECT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_close_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_close(&headers));
        headers.insert(CONNECTION, "keep-alive, Close".parse().unwrap());
        assert!(wants_close(&headers));
    }

    #[test]
    fn body_permission_by_method() {
        assert!(!permits_request_body(&Method::GET));
        assert!(!permits_request_body(&Method::HEAD));
        assert!(permits_request_body(&Method::POST));
        assert!(permits_request_body(&Method::DELETE));
    }
}
