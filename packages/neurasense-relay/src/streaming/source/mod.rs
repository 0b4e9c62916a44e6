// Sample sources for the relay pipeline
//
// A `SampleSource` owns a local ingest socket and emits `sampleReceived` /
// `malformedSample` events into the router. The session coordinator drives
// start/stop through this trait, so alternative sources (or test doubles) can
// be plugged in without touching the coordinator.
//
// Current implementations:
// - UDP: JSON datagrams from the acquisition bridge (OpenBCI GUI networking widget)

mod udp;

use crate::streaming::types::{AdapterResult, SourceStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

pub use udp::{decode_datagram, UdpSampleSource};

/// Completion signal for a stopped source.
///
/// `stop()` returns immediately; await [`StopHandle::closed`] when the port
/// must be free again before continuing (e.g. to rebind right away).
#[derive(Debug)]
pub struct StopHandle {
    listener: Option<JoinHandle<()>>,
}

impl StopHandle {
    /// Handle for a source that was not running
    pub fn already_closed() -> Self {
        Self { listener: None }
    }

    pub(crate) fn pending(listener: JoinHandle<()>) -> Self {
        Self {
            listener: Some(listener),
        }
    }

    /// Resolves once the underlying socket has been released
    pub async fn closed(self) {
        if let Some(listener) = self.listener {
            // The socket is dropped before the task returns, panicked or not
            let _ = listener.await;
        }
    }
}

/// Trait for sample ingest sources
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Bind and start emitting events. Returns the bound local address.
    async fn start(&mut self, port: u16, host: &str) -> AdapterResult<SocketAddr>;

    /// Stop listening. Calling this on a stopped source is a no-op.
    fn stop(&mut self) -> AdapterResult<StopHandle>;

    fn is_running(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}
