//! Recovery from failed attempts, and follow-up requests.
//!
//! This stage re-enters the chain: one `proceed` per attempt. Transport
//! failures recover onto another route when one remains; a connection that
//! shut down before the request was transmitted retries transparently.
//! What constitutes a follow-up (redirects, auth challenges) is the
//! injected policy's business.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{Chain, Interceptor};
use crate::error::{Error, ErrorKind};
use crate::request::Request;
use crate::response::Response;

/// Attempts plus follow-ups per call. Matches the limit common across
/// browsers and HTTP stacks.
const MAX_FOLLOW_UPS: u32 = 20;

/// Decides whether a response demands a follow-up request (a redirect, an
/// auth retry). Returning `None` surfaces the response to the caller.
pub trait FollowUpPolicy: Send + Sync {
    /// The next request to issue for `response`, if any.
    fn follow_up(&self, response: &Response) -> Result<Option<Request>, Error>;
}

/// Policy that never follows up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFollowUp {
    _priv: (),
}

impl FollowUpPolicy for NoFollowUp {
    fn follow_up(&self, _response: &Response) -> Result<Option<Request>, Error> {
        Ok(None)
    }
}

pub(crate) struct RetryInterceptor {
    follow_up: Arc<dyn FollowUpPolicy>,
}

impl RetryInterceptor {
    pub(crate) fn new(follow_up: Arc<dyn FollowUpPolicy>) -> Self {
        Self { follow_up }
    }

    /// Whether `error` may be recovered by another attempt.
    async fn recoverable(chain: &Chain, request: &Request, error: &Error) -> bool {
        if !error.is_recoverable() {
            return false;
        }
        if request
            .body()
            .map(|body| !body.is_replayable())
            .unwrap_or(false)
        {
            return false;
        }
        match error.kind() {
            // Nothing was transmitted: safe to retry on a fresh
            // connection to the same route.
            ErrorKind::ConnectionShutdown => true,
            _ => chain.call_inner().retry_after_failure().await,
        }
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error> {
        let mut request = chain.request().clone();
        let mut follow_ups = 0u32;

        loop {
            if chain.call_inner().is_canceled() {
                return Err(Error::canceled());
            }

            let response = match chain.proceed(request.clone()).await {
                Ok(response) => response,
                Err(error) => {
                    // The attempt's exchange is dead either way.
                    chain.call_inner().exit_exchange(true);

                    if error.is_canceled() {
                        return Err(error);
                    }
                    if !Self::recoverable(chain, &request, &error).await {
                        return Err(error);
                    }
                    follow_ups += 1;
                    if follow_ups > MAX_FOLLOW_UPS {
                        return Err(error);
                    }
                    debug!(%error, attempt = follow_ups, "recovering from failed attempt");
                    continue;
                }
            };

            if chain.call_inner().is_canceled() {
                if let Some(body) = response.into_body() {
                    drop(body);
                }
                return Err(Error::canceled());
            }

            let Some(next) = self.follow_up.follow_up(&response)? else {
                return Ok(response);
            };

            if next
                .body()
                .map(|body| !body.is_replayable())
                .unwrap_or(false)
            {
                return Err(Error::contract(
                    "cannot follow up a request with a one-shot body",
                ));
            }

            follow_ups += 1;
            if follow_ups > MAX_FOLLOW_UPS {
                return Err(Error::protocol(format!(
                    "too many follow-up requests: {follow_ups}"
                )));
            }

            trace!(next = %next, "following up");
            if let Some(body) = response.into_body() {
                body.close().await;
            }
            request = next;
        }
    }
}
