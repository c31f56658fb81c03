//! Parallel batches.
//!
//! Calls issued on a `Batch` are prepared straight away on the caller's
//! thread and hand back a `Deferred`. When the batch drains, every pending
//! transport dispatch runs on its own scoped worker thread with a forked
//! connection pool; completions then run back on the caller's thread in
//! issue order.

use std::fmt;
use std::rc::Rc;
use std::thread;

use once_cell::unsync::OnceCell;
use tracing::{debug, warn};

use crate::client::{CallResult, Client, Prepared, Stage};
use crate::error::ApiError;
use crate::http::{HttpMethod, RawResponse};
use crate::request::Params;

/// Placeholder for a batched call's outcome.
#[derive(Clone, Default)]
pub struct Deferred(Rc<OnceCell<Result<CallResult, ApiError>>>);

impl Deferred {
    /// The outcome, or `None` while the batch has not drained.
    pub fn get(&self) -> Option<&Result<CallResult, ApiError>> {
        self.0.get()
    }

    pub fn is_ready(&self) -> bool {
        self.0.get().is_some()
    }

    /// The successful result, if the call has completed and succeeded.
    pub fn result(&self) -> Option<&CallResult> {
        self.get().and_then(|outcome| outcome.as_ref().ok())
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(outcome) => f.debug_tuple("Deferred").field(outcome).finish(),
            None => f.write_str("Deferred(<pending>)"),
        }
    }
}

struct Entry {
    slot: Deferred,
    stage: Result<Stage, ApiError>,
}

pub struct Batch<'c> {
    client: &'c Client,
    entries: Vec<Entry>,
}

impl<'c> Batch<'c> {
    pub(crate) fn new(client: &'c Client) -> Self {
        Self {
            client,
            entries: Vec::new(),
        }
    }

    pub fn call(&mut self, resource: &str, call: &str, params: Params) -> Deferred {
        let stage = self.client.prepare_named(resource, call, params);
        self.push(stage)
    }

    pub fn request(&mut self, resource: &str, url: &str, method: HttpMethod, params: Params) -> Deferred {
        let stage = self.client.prepare_direct(resource, url, method, params);
        self.push(stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, stage: Result<Stage, ApiError>) -> Deferred {
        let slot = Deferred::default();
        self.entries.push(Entry {
            slot: slot.clone(),
            stage,
        });
        slot
    }

    pub(crate) fn drain(self) {
        let client = self.client;
        let mut pending: Vec<(Deferred, Box<Prepared>)> = Vec::new();
        for entry in self.entries {
            match entry.stage {
                Ok(Stage::Pending(prepared)) => pending.push((entry.slot, prepared)),
                Ok(Stage::Ready(result)) => fill(&entry.slot, Ok(result)),
                Err(err) => fill(&entry.slot, Err(err)),
            }
        }
        if pending.is_empty() {
            return;
        }

        debug!(requests = pending.len(), "dispatching batch");
        let outcomes: Vec<Result<RawResponse, ApiError>> = thread::scope(|scope| {
            let handles: Vec<_> = pending
                .iter()
                .map(|(_, prepared)| {
                    let pool = client.pool().fork();
                    let prepared: &Prepared = prepared;
                    scope.spawn(move || Client::dispatch(&pool, prepared))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        for ((slot, prepared), outcome) in pending.into_iter().zip(outcomes) {
            fill(&slot, client.complete(*prepared, outcome));
        }
    }
}

fn fill(slot: &Deferred, outcome: Result<CallResult, ApiError>) {
    if slot.0.set(outcome).is_err() {
        warn!("batch placeholder filled twice, keeping the first outcome");
    }
}
