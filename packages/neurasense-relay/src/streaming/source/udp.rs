// UDP sample source
//
// Binds a UDP socket and decodes each datagram as UTF-8 JSON of the form
// `{"data": [[ch0 samples...], [ch1 samples...], ...]}`. Other top-level
// fields (the bridge also sends e.g. "type") are ignored.

use super::{SampleSource, StopHandle};
use crate::streaming::router::{EventRouter, PipelineEvent};
use crate::streaming::types::{
    AdapterError, AdapterResult, MalformedSample, MalformedSampleEvent, SampleBatch, SourceStats,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wire shape of one datagram
#[derive(Deserialize)]
struct SamplePacket {
    data: Vec<Vec<f64>>,
}

/// Decode one datagram into a batch.
///
/// `expected_channels` pins the channel count configured for the headset;
/// `None` accepts any non-zero count.
pub fn decode_datagram(
    data: &[u8],
    expected_channels: Option<usize>,
) -> Result<SampleBatch, MalformedSample> {
    let text =
        std::str::from_utf8(data).map_err(|e| MalformedSample::InvalidUtf8(e.to_string()))?;

    let packet: SamplePacket =
        serde_json::from_str(text).map_err(|e| MalformedSample::InvalidJson(e.to_string()))?;

    if packet.data.is_empty() {
        return Err(MalformedSample::NoChannels);
    }

    if let Some(expected) = expected_channels {
        if packet.data.len() != expected {
            return Err(MalformedSample::ChannelCount {
                expected,
                actual: packet.data.len(),
            });
        }
    }

    Ok(SampleBatch::new(packet.data))
}

#[derive(Default)]
struct SourceCounters {
    batches_received: AtomicU64,
    malformed_datagrams: AtomicU64,
    bytes_received: AtomicU64,
}

struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the listener task needs besides the socket
#[derive(Clone)]
struct DatagramHandler {
    router: EventRouter,
    channel_count: Option<usize>,
    counters: Arc<SourceCounters>,
}

impl DatagramHandler {
    fn handle(&self, data: &[u8], peer: SocketAddr) {
        self.counters
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        match decode_datagram(data, self.channel_count) {
            Ok(batch) => {
                self.counters.batches_received.fetch_add(1, Ordering::Relaxed);
                self.router
                    .emit(PipelineEvent::SampleReceived(Arc::new(batch)));
            }
            Err(error) => {
                self.counters
                    .malformed_datagrams
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed datagram from {}: {}", peer, error);
                self.router
                    .emit(PipelineEvent::MalformedSample(Arc::new(MalformedSampleEvent {
                        peer,
                        bytes: data.len(),
                        error,
                    })));
            }
        }
    }
}

pub struct UdpSampleSource {
    router: EventRouter,
    buffer_size: usize,
    channel_count: Option<usize>,
    listener: Option<Listener>,
    counters: Arc<SourceCounters>,
}

impl UdpSampleSource {
    pub fn new(router: EventRouter, buffer_size: usize, channel_count: Option<usize>) -> Self {
        Self {
            router,
            buffer_size,
            channel_count,
            listener: None,
            counters: Arc::new(SourceCounters::default()),
        }
    }

    fn handler(&self) -> DatagramHandler {
        DatagramHandler {
            router: self.router.clone(),
            channel_count: self.channel_count,
            counters: Arc::clone(&self.counters),
        }
    }
}

#[async_trait]
impl SampleSource for UdpSampleSource {
    async fn start(&mut self, port: u16, host: &str) -> AdapterResult<SocketAddr> {
        if let Some(listener) = &self.listener {
            if !listener.task.is_finished() {
                return Err(AdapterError::AlreadyRunning(listener.local_addr));
            }
            // Listener died on a receive error; allow a fresh bind
            self.listener = None;
        }

        info!("Binding UDP socket: {}:{}", host, port);

        let socket = UdpSocket::bind((host, port))
            .await
            .map_err(|e| AdapterError::Bind(format!("{}:{}: {}", host, port, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| AdapterError::Bind(format!("{}:{}: {}", host, port, e)))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_listener(
            socket,
            local_addr,
            self.buffer_size,
            self.handler(),
            cancel.clone(),
        ));

        self.listener = Some(Listener {
            local_addr,
            cancel,
            task,
        });

        info!("UDP listener started on {}", local_addr);
        Ok(local_addr)
    }

    fn stop(&mut self) -> AdapterResult<StopHandle> {
        let Some(listener) = self.listener.take() else {
            debug!("UDP source already stopped");
            return Ok(StopHandle::already_closed());
        };

        info!("Stopping UDP listener on {}", listener.local_addr);
        listener.cancel.cancel();
        Ok(StopHandle::pending(listener.task))
    }

    fn is_running(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.task.is_finished())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            batches_received: self.counters.batches_received.load(Ordering::Relaxed),
            malformed_datagrams: self.counters.malformed_datagrams.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpSampleSource {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
        }
    }
}

async fn run_listener(
    socket: UdpSocket,
    local_addr: SocketAddr,
    buffer_size: usize,
    handler: DatagramHandler,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("UDP listener on {} cancelled", local_addr);
                break;
            }

            received = socket.recv_from(&mut buffer) => {
                match received {
                    Ok((len, peer)) => handler.handle(&buffer[..len], peer),
                    // ICMP port-unreachable surfaces here on some platforms
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                        debug!("Ignoring transient UDP error: {}", e);
                    }
                    Err(e) => {
                        error!("UDP receive error on {}: {}", local_addr, e);
                        break;
                    }
                }
            }
        }
    }

    drop(socket);
    info!("UDP listener on {} closed", local_addr);
}
