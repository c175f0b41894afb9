//! Policy for when asynchronous calls run.
//!
//! Enqueued calls wait in a ready queue until capacity allows them to run
//! on the runtime, bounded both globally and per host. Synchronous calls
//! are only counted, never queued: they run on their caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::call::CallInner;
use crate::error::Error;
use crate::response::Response;

type Callback = Box<dyn FnOnce(Result<Response, Error>) + Send + 'static>;

/// Runs enqueued calls with global and per-host concurrency caps.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    max_requests: usize,
    max_requests_per_host: usize,
    state: Mutex<DispatcherState>,
}

#[derive(Default)]
struct DispatcherState {
    ready: VecDeque<AsyncCall>,
    running: usize,
    running_sync: usize,
    per_host: HashMap<String, Arc<AtomicUsize>>,
}

pub(crate) struct AsyncCall {
    call: Arc<CallInner>,
    callback: Callback,
    host: String,
    per_host: Arc<AtomicUsize>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(64, 5)
    }
}

impl Dispatcher {
    /// A dispatcher running at most `max_requests` calls, at most
    /// `max_requests_per_host` of them against any single host.
    pub fn new(max_requests: usize, max_requests_per_host: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                max_requests,
                max_requests_per_host,
                state: Mutex::new(DispatcherState::default()),
            }),
        }
    }

    /// Calls currently executing, asynchronous and synchronous.
    pub fn running_calls_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.running + state.running_sync
    }

    /// Enqueued calls not yet running.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Register an asynchronous call and run it when capacity allows.
    pub(crate) fn enqueue(&self, call: Arc<CallInner>, callback: Callback) {
        let host = call.request().uri().host().unwrap_or_default().to_owned();
        {
            let mut state = self.inner.state.lock();
            let per_host = state
                .per_host
                .entry(host.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            state.ready.push_back(AsyncCall {
                call,
                callback,
                host,
                per_host,
            });
        }
        self.promote_and_execute();
    }

    /// A synchronous call entered `execute`.
    pub(crate) fn executed(&self) {
        self.inner.state.lock().running_sync += 1;
    }

    /// A synchronous call left `execute`.
    pub(crate) fn finished(&self) {
        self.inner.state.lock().running_sync -= 1;
    }

    fn finished_async(&self, host: &str, per_host: &Arc<AtomicUsize>) {
        {
            let mut state = self.inner.state.lock();
            state.running -= 1;
            if per_host.fetch_sub(1, Ordering::AcqRel) == 1 {
                state.per_host.remove(host);
            }
        }
        self.promote_and_execute();
    }

    /// Move ready calls into execution until a cap is hit.
    fn promote_and_execute(&self) {
        let mut executable = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let mut index = 0;
            while index < state.ready.len() {
                if state.running >= self.inner.max_requests {
                    break;
                }
                let candidate = &state.ready[index];
                if candidate.per_host.load(Ordering::Acquire) >= self.inner.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let async_call = state.ready.remove(index).expect("index in bounds");
                async_call.per_host.fetch_add(1, Ordering::AcqRel);
                state.running += 1;
                executable.push(async_call);
            }
        }

        for async_call in executable {
            let dispatcher = self.clone();
            trace!(host = %async_call.host, "starting enqueued call");
            tokio::spawn(async move {
                let AsyncCall {
                    call,
                    callback,
                    host,
                    per_host,
                } = async_call;
                call.timeout_enter();
                let result = call.clone().run().await;
                callback(result);
                dispatcher.finished_async(&host, &per_host);
            });
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &self.inner.max_requests)
            .field("max_requests_per_host", &self.inner.max_requests_per_host)
            .field("running", &state.running)
            .field("queued", &state.ready.len())
            .finish()
    }
}
