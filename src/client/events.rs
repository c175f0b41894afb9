//! Call lifecycle events.

use crate::error::Error;
use crate::response::Response;

/// Observer of call and connection lifecycle moments.
///
/// Every method has a no-op default; implementations override what they
/// care about. Listeners are shared across calls and invoked from whatever
/// task the event happens on, so implementations must be cheap and
/// thread-safe.
pub trait EventListener: Send + Sync {
    /// A call was submitted via `execute` or `enqueue`.
    fn call_start(&self) {}

    /// The call finished successfully and released its resources.
    fn call_end(&self) {}

    /// The call failed; `error` is what the caller will see.
    fn call_failed(&self, _error: &Error) {}

    /// `cancel` was invoked on the call.
    fn canceled(&self) {}

    /// The call released its connection back to (or out of) the pool.
    fn connection_released(&self) {}

    /// A cached response satisfied the call.
    fn cache_hit(&self) {}

    /// No usable cache entry existed; going to the network.
    fn cache_miss(&self) {}

    /// A conditional revalidation came back 304 and the cached body was
    /// served.
    fn cache_conditional_hit(&self) {}

    /// The cache could not satisfy an `only-if-cached` request.
    fn satisfaction_failure(&self) {}

    /// About to read response headers from the wire.
    fn response_headers_start(&self) {}

    /// Response headers arrived.
    fn response_headers_end(&self, _response: &Response) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener {
    _priv: (),
}

impl EventListener for NoopListener {}
