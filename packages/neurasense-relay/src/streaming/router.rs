// Event router - process-wide dispatch hub for pipeline events
//
// Sources (UDP listener, relay reader) emit typed events; consumers (render
// sinks, the upstream forwarder, status indicators) register handlers per
// event kind. Dispatch is synchronous and runs on the emitting task, so a
// handler that needs async work must spawn it and return.

use crate::streaming::types::{
    ConnectionState, MalformedSampleEvent, ProcessedResult, RelayErrorEvent, SampleBatch,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Event names understood by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    SampleReceived,
    MalformedSample,
    ProcessedResultReceived,
    RelayError,
    ConnectionStateChanged,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SampleReceived => "sampleReceived",
            EventKind::MalformedSample => "malformedSample",
            EventKind::ProcessedResultReceived => "processedResultReceived",
            EventKind::RelayError => "relayError",
            EventKind::ConnectionStateChanged => "connectionStateChanged",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Events carried by the router.
///
/// Payloads are shared, never copied per handler. Handlers must treat them as
/// read-only.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SampleReceived(Arc<SampleBatch>),
    MalformedSample(Arc<MalformedSampleEvent>),
    ProcessedResultReceived(Arc<ProcessedResult>),
    RelayError(Arc<RelayErrorEvent>),
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::SampleReceived(_) => EventKind::SampleReceived,
            PipelineEvent::MalformedSample(_) => EventKind::MalformedSample,
            PipelineEvent::ProcessedResultReceived(_) => EventKind::ProcessedResultReceived,
            PipelineEvent::RelayError(_) => EventKind::RelayError,
            PipelineEvent::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
        }
    }
}

/// Outcome of a single handler invocation
pub type HandlerResult = anyhow::Result<()>;

type Handler = Arc<dyn Fn(&PipelineEvent) -> HandlerResult + Send + Sync>;

/// Token returned by [`EventRouter::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct RouterInner {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// Cloneable handle to the shared router
#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PipelineEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Deliver an event to every handler registered for its kind.
    ///
    /// The handler list is snapshotted before the first call, so handlers
    /// registered or removed while dispatching take effect on the next emit.
    /// A handler that errors or panics is logged and skipped; the rest still
    /// run. Returns the number of handlers that completed successfully.
    pub fn emit(&self, event: PipelineEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(HandlerId, Handler)> = match self.inner.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.inner.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    warn!("Handler {:?} for {} failed: {:#}", id, kind, e);
                }
                Err(panic) => {
                    self.inner.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Handler {:?} for {} panicked: {}",
                        id,
                        kind,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        delivered
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Handler invocations that returned an error or panicked
    pub fn failed_deliveries(&self) -> u64 {
        self.inner.failed_deliveries.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
