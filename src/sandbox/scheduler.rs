//! Per-run cooperative scheduler.
//!
//! Guest code runs on one thread. Every host capability call (`fetch`, a
//! body read) only queues a [`HostCall`] and hands the guest a pending
//! promise. The scheduler alternates between two phases until the guest's
//! final promise settles:
//!
//! 1. drain the engine job queue (guest continuations),
//! 2. perform every queued host call on the tokio runtime, concurrently,
//!    then settle their promises in the order they were queued.
//!
//! Each run owns a [`RunState`] arena holding the queue and every response
//! opened by the run. The arena is cleared on every exit path, which drops
//! the unread network streams and the JS handles it holds.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::join_all;
use rquickjs::promise::PromiseState;
use rquickjs::{CaughtError, Ctx, Function, IntoJs, Object, Promise, Value};
use tracing::debug;

use super::{bindings, Governor, SandboxError};
use crate::http::{FetchClient, FetchError, RequestOptions, ResponseHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFormat {
    Text,
    Json,
    Blob,
}

/// Work a guest asked the host to do.
pub(crate) enum HostOp {
    Fetch { url: String, options: RequestOptions },
    ReadBody { handle: Arc<ResponseHandle>, format: BodyFormat },
}

pub(crate) enum HostValue {
    Response(ResponseHandle),
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl HostOp {
    async fn perform(self, fetch: &FetchClient) -> Result<HostValue, FetchError> {
        match self {
            HostOp::Fetch { url, options } => fetch.fetch(&url, options).await.map(HostValue::Response),
            HostOp::ReadBody { handle, format } => match format {
                BodyFormat::Text => handle.text().await.map(HostValue::Text),
                BodyFormat::Json => handle.json().await.map(HostValue::Json),
                BodyFormat::Blob => handle.bytes().await.map(|b| HostValue::Bytes(b.to_vec())),
            },
        }
    }
}

/// One suspended guest promise and the host work that will settle it.
pub(crate) struct HostCall<'js> {
    op: HostOp,
    resolve: Function<'js>,
    reject: Function<'js>,
}

#[derive(Default)]
pub(crate) struct RunState<'js> {
    queue: VecDeque<HostCall<'js>>,
    responses: Vec<Arc<ResponseHandle>>,
    /// Error objects handed to the guest as rejections, with the error
    /// behind each one.
    failures: Vec<(Object<'js>, FetchError)>,
}

pub(crate) type SharedState<'js> = Rc<RefCell<RunState<'js>>>;

impl<'js> RunState<'js> {
    pub(crate) fn enqueue(&mut self, op: HostOp, resolve: Function<'js>, reject: Function<'js>) {
        self.queue.push_back(HostCall { op, resolve, reject });
    }

    fn take_queue(&mut self) -> Vec<HostCall<'js>> {
        self.queue.drain(..).collect()
    }

    fn adopt(&mut self, handle: ResponseHandle) -> Arc<ResponseHandle> {
        let handle = Arc::new(handle);
        self.responses.push(Arc::clone(&handle));
        handle
    }

    pub(crate) fn record_failure(&mut self, rejection: Object<'js>, error: FetchError) {
        self.failures.push((rejection, error));
    }

    /// The host error behind `thrown`, if it is one of the run's own
    /// rejection objects (compared by identity).
    pub(crate) fn failure_for(&self, thrown: &Object<'js>) -> Option<FetchError> {
        self.failures
            .iter()
            .find(|(rejection, _)| rejection == thrown)
            .map(|(_, e)| e.clone())
    }

    pub(crate) fn open_responses(&self) -> usize {
        self.responses.len()
    }

    /// Releases everything the run acquired.
    pub(crate) fn clear(&mut self) {
        for handle in self.responses.drain(..) {
            handle.release();
        }
        self.queue.clear();
        self.failures.clear();
    }
}

pub(crate) struct Scheduler<'a, 'js> {
    pub(crate) ctx: Ctx<'js>,
    pub(crate) state: SharedState<'js>,
    pub(crate) governor: &'a Governor,
    pub(crate) fetch: &'a FetchClient,
    pub(crate) runtime: &'a tokio::runtime::Handle,
}

impl<'a, 'js> Scheduler<'a, 'js> {
    /// Drives `root` to its final value. A non-promise value is final as is.
    pub(crate) fn run_to_completion(&self, root: Value<'js>) -> Result<Value<'js>, SandboxError> {
        let Some(promise) = root.as_promise().cloned() else {
            return Ok(root);
        };

        loop {
            while self.ctx.execute_pending_job() {
                self.governor.check()?;
            }
            self.governor.check()?;

            match promise.state() {
                PromiseState::Resolved => return self.resolved(&promise),
                PromiseState::Rejected => {
                    let error = match promise.result::<Value<'js>>() {
                        Some(Err(e)) => e,
                        _ => rquickjs::Error::Exception,
                    };
                    return Err(self.failure(error));
                }
                PromiseState::Pending => {}
            }

            let calls = self.state.borrow_mut().take_queue();
            if calls.is_empty() {
                return Err(SandboxError::GuestException(
                    "script promise never settled".to_string(),
                ));
            }
            self.perform(calls)?;
        }
    }

    fn resolved(&self, promise: &Promise<'js>) -> Result<Value<'js>, SandboxError> {
        match promise.result::<Value<'js>>() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(self.failure(e)),
            None => Err(SandboxError::Engine("promise state changed while reading".to_string())),
        }
    }

    /// Runs a batch of host calls concurrently, then settles each guest
    /// promise in queue order.
    fn perform(&self, calls: Vec<HostCall<'js>>) -> Result<(), SandboxError> {
        debug!("Performing {} host call(s)", calls.len());

        let mut ops = Vec::with_capacity(calls.len());
        let mut settlers = Vec::with_capacity(calls.len());
        for call in calls {
            ops.push(call.op);
            settlers.push((call.resolve, call.reject));
        }

        let remaining = self.governor.remaining();
        let fetch = self.fetch;
        let outcomes = self.runtime.block_on(async move {
            tokio::time::timeout(remaining, join_all(ops.into_iter().map(|op| op.perform(fetch)))).await
        });
        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(_) => return Err(self.governor.expire()),
        };

        for ((resolve, reject), outcome) in settlers.into_iter().zip(outcomes) {
            self.settle(resolve, reject, outcome)
                .map_err(|e| self.failure(e))?;
        }
        Ok(())
    }

    fn settle(
        &self,
        resolve: Function<'js>,
        reject: Function<'js>,
        outcome: Result<HostValue, FetchError>,
    ) -> rquickjs::Result<()> {
        match outcome {
            Ok(value) => {
                let value = self.to_js(value)?;
                resolve.call::<_, ()>((value,))
            }
            Err(error) => bindings::reject_with(&self.ctx, &self.state, &reject, error),
        }
    }

    fn to_js(&self, value: HostValue) -> rquickjs::Result<Value<'js>> {
        match value {
            HostValue::Response(handle) => {
                let handle = self.state.borrow_mut().adopt(handle);
                bindings::response_object(&self.ctx, &self.state, handle)?.into_js(&self.ctx)
            }
            HostValue::Text(text) => text.into_js(&self.ctx),
            HostValue::Json(json) => self.ctx.json_parse(json.to_string()),
            HostValue::Bytes(bytes) => rquickjs::ArrayBuffer::new(self.ctx.clone(), bytes)?.into_js(&self.ctx),
        }
    }

    /// Maps an engine error to the run's outcome. Bound violations win over
    /// whatever exception the engine raised while unwinding.
    pub(crate) fn failure(&self, error: rquickjs::Error) -> SandboxError {
        if let Err(bound) = self.governor.check() {
            return bound;
        }
        if matches!(error, rquickjs::Error::Allocation) {
            return SandboxError::MemoryExceeded;
        }

        let caught = CaughtError::from_error(&self.ctx, error);
        if let CaughtError::Exception(ex) = &caught {
            if let Some(fetch_error) = self.state.borrow().failure_for(ex.as_object()) {
                return SandboxError::Fetch(fetch_error);
            }
        }
        let description = describe(&caught);
        if description.contains("out of memory") {
            return SandboxError::MemoryExceeded;
        }
        SandboxError::GuestException(description)
    }
}

/// `"Name: message"` for a thrown value.
fn describe(caught: &CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(ex) => {
            let message = ex.message().unwrap_or_default();
            let name = ex
                .get::<_, Option<rquickjs::Coerced<String>>>("name")
                .ok()
                .flatten()
                .map(|n| n.0)
                .unwrap_or_else(|| "Error".to_string());
            if message.is_empty() {
                name
            } else {
                format!("{name}: {message}")
            }
        }
        CaughtError::Value(value) => {
            value
                .get::<rquickjs::Coerced<String>>()
                .map(|c| c.0)
                .unwrap_or_else(|_| format!("{:?}", value.type_of()))
        }
        CaughtError::Error(e) => e.to_string(),
    }
}
