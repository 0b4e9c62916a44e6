// Relay client - persistent WebSocket link to the processing backend
//
// Outbound sample batches are serialized as `{"packet": .., "isPhantom": ..}`
// text frames; inbound text frames are parsed as processed results and
// re-emitted through the router.
//
// State machine:
//   Disconnected -> connect() -> Connecting -> open -> Connected
//   Connected -> disconnect() -> Closing -> Disconnected
//   Connected -> transport error / remote close -> Disconnected (+ relayError)
//
// There is no automatic reconnect. Each successful connect bumps a generation
// counter so reader/writer tasks of an old connection can never touch the
// state of a newer one.

use crate::streaming::router::{EventRouter, PipelineEvent};
use crate::streaming::types::{
    ConnectionState, ProcessedResult, RelayEnvelope, RelayError, RelayErrorEvent, RelayResult,
    RelayStats,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Give up on a connect attempt after this long
    pub connect_timeout: Duration,
    /// Upper bound on flushing queued frames and the close handshake
    pub close_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// Upstream link used by the session coordinator
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Open the connection. Resolves once the socket is open.
    async fn connect(&self, url: &str) -> RelayResult<()>;

    /// Queue one envelope for transmission. Returns its sequence position on
    /// this connection. Never panics; fails softly when not connected.
    fn send(&self, envelope: RelayEnvelope) -> RelayResult<u64>;

    /// Close the connection. Safe to call in any state.
    async fn disconnect(&self) -> RelayResult<()>;

    fn state(&self) -> ConnectionState;

    fn stats(&self) -> RelayStats {
        RelayStats::default()
    }
}

#[derive(Default)]
struct RelayCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    results_received: AtomicU64,
    invalid_results: AtomicU64,
    transport_errors: AtomicU64,
}

#[derive(Default)]
struct RelayInner {
    state: ConnectionState,
    generation: u64,
    url: String,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    pending_connect: Option<CancellationToken>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    sequence: u64,
    warned_not_connected: bool,
    state_seq: u64,
}

struct RelayShared {
    router: EventRouter,
    config: RelayClientConfig,
    inner: Mutex<RelayInner>,
    state_tx: watch::Sender<ConnectionState>,
    counters: RelayCounters,
    published_seq: Mutex<u64>,
}

/// A state transition waiting to be published
struct StateChange {
    seq: u64,
    event: PipelineEvent,
}

/// What disconnect() has to do once the lock is released
enum Teardown {
    Done,
    WaitForOtherCaller,
    Close {
        writer: Option<JoinHandle<()>>,
        reader: Option<JoinHandle<()>>,
        generation: u64,
    },
}

impl RelayShared {
    /// Must be called with the lock held; the returned change is published
    /// after the lock is released.
    fn set_state(&self, inner: &mut RelayInner, next: ConnectionState) -> Option<StateChange> {
        let previous = inner.state;
        if previous == next {
            return None;
        }
        inner.state = next;
        inner.state_seq += 1;
        self.state_tx.send_replace(next);
        debug!("Relay state {} -> {}", previous, next);
        Some(StateChange {
            seq: inner.state_seq,
            event: PipelineEvent::ConnectionStateChanged {
                previous,
                current: next,
            },
        })
    }

    /// Publish state changes in transition order. A change that lost the
    /// race against a newer one is dropped, so handlers always end on the
    /// current state.
    fn publish(&self, changes: impl IntoIterator<Item = StateChange>) {
        let mut published = self.published_seq.lock();
        for change in changes {
            if change.seq <= *published {
                debug!("Dropping stale relay state event #{}", change.seq);
                continue;
            }
            *published = change.seq;
            self.router.emit(change.event);
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.state == ConnectionState::Connected
    }

    fn handle_inbound(&self, generation: u64, text: &str) {
        if !self.is_live(generation) {
            return;
        }

        match ProcessedResult::from_json(text) {
            Ok(result) => {
                self.counters.results_received.fetch_add(1, Ordering::Relaxed);
                self.router
                    .emit(PipelineEvent::ProcessedResultReceived(Arc::new(result)));
            }
            Err(e) => {
                self.counters.invalid_results.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping unparseable backend message ({} bytes): {}",
                    text.len(),
                    e
                );
            }
        }
    }

    /// Connection lost while Connected. Only the first report per connection
    /// has any effect.
    fn fail_transport(&self, generation: u64, reason: String) {
        let (state_event, url) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            inner.outbound = None;
            inner.writer = None;
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            (
                self.set_state(&mut inner, ConnectionState::Disconnected),
                inner.url.clone(),
            )
        };

        self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
        error!("Relay connection to {} lost: {}", url, reason);

        self.publish(state_event);
        self.router
            .emit(PipelineEvent::RelayError(Arc::new(RelayErrorEvent {
                url,
                message: reason,
                occurred_at: Utc::now(),
            })));
    }
}

/// WebSocket client for the processing backend
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<RelayShared>,
}

impl RelayClient {
    pub fn new(router: EventRouter, config: RelayClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(RelayShared {
                router,
                config,
                inner: Mutex::new(RelayInner::default()),
                state_tx,
                counters: RelayCounters::default(),
                published_seq: Mutex::new(0),
            }),
        }
    }

    /// Watch connection state changes without going through the router
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// URL of the current or last connection attempt
    pub fn url(&self) -> Option<String> {
        let inner = self.shared.inner.lock();
        (!inner.url.is_empty()).then(|| inner.url.clone())
    }
}

#[async_trait]
impl RelayLink for RelayClient {
    async fn connect(&self, url: &str) -> RelayResult<()> {
        let shared = &self.shared;

        let (generation, abort, event) = {
            let mut inner = shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => {
                    debug!("Relay already connected to {}", inner.url);
                    return Ok(());
                }
                ConnectionState::Connecting => return Err(RelayError::AlreadyConnecting),
                ConnectionState::Closing => return Err(RelayError::Closing),
                ConnectionState::Disconnected => {}
            }
            inner.generation += 1;
            inner.url = url.to_string();
            let abort = CancellationToken::new();
            inner.pending_connect = Some(abort.clone());
            let event = shared.set_state(&mut inner, ConnectionState::Connecting);
            (inner.generation, abort, event)
        };
        shared.publish(event);

        let pending = PendingConnect {
            shared: Arc::clone(shared),
            generation,
            url: url.to_string(),
            armed: true,
        };

        info!("Connecting to processing backend at {}", url);

        let connect_timeout = shared.config.connect_timeout;
        let outcome = tokio::select! {
            _ = abort.cancelled() => Err(RelayError::Aborted),
            attempt = tokio::time::timeout(connect_timeout, connect_async(url)) => match attempt {
                Ok(Ok((ws_stream, _))) => Ok(ws_stream),
                Ok(Err(e)) => Err(RelayError::Connect(e.to_string())),
                Err(_) => Err(RelayError::Timeout(connect_timeout.as_millis() as u64)),
            },
        };
        pending.disarm();

        let mut inner = shared.inner.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            drop(inner);
            debug!("Relay connect to {} superseded by disconnect", url);
            return Err(RelayError::Aborted);
        }
        inner.pending_connect = None;

        match outcome {
            Ok(ws_stream) => {
                let (write, read) = ws_stream.split();
                let (tx, rx) = mpsc::unbounded_channel();

                inner.outbound = Some(tx);
                inner.sequence = 0;
                inner.warned_not_connected = false;
                inner.writer = Some(tokio::spawn(write_task(
                    write,
                    rx,
                    Arc::clone(shared),
                    generation,
                )));
                inner.reader = Some(tokio::spawn(read_task(
                    read,
                    Arc::clone(shared),
                    generation,
                )));
                let event = shared.set_state(&mut inner, ConnectionState::Connected);
                drop(inner);

                shared.publish(event);
                info!("Connected to processing backend at {}", url);
                Ok(())
            }
            Err(e) => {
                let event = shared.set_state(&mut inner, ConnectionState::Disconnected);
                drop(inner);

                shared.publish(event);
                error!("Relay connect to {} failed: {}", url, e);
                Err(e)
            }
        }
    }

    fn send(&self, envelope: RelayEnvelope) -> RelayResult<u64> {
        let shared = &self.shared;

        let (outbound, sequence) = {
            let mut inner = shared.inner.lock();
            let outbound = match inner.state {
                ConnectionState::Connected => inner.outbound.clone(),
                _ => None,
            };
            let Some(outbound) = outbound else {
                shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if !inner.warned_not_connected {
                    inner.warned_not_connected = true;
                    warn!(
                        "Relay is {}, dropping outbound samples until reconnected",
                        inner.state
                    );
                }
                return Err(RelayError::NotConnected);
            };
            inner.sequence += 1;
            (outbound, inner.sequence)
        };

        let json = serde_json::to_string(&envelope)?;
        if outbound.send(Message::Text(json.into())).is_err() {
            // Writer already gone; the reader will report the transport failure
            shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::NotConnected);
        }

        shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    async fn disconnect(&self) -> RelayResult<()> {
        let shared = &self.shared;
        let mut changes = Vec::new();

        let teardown = {
            let mut inner = shared.inner.lock();
            match inner.state {
                ConnectionState::Disconnected => Teardown::Done,
                ConnectionState::Closing => Teardown::WaitForOtherCaller,
                ConnectionState::Connecting => {
                    inner.generation += 1;
                    if let Some(abort) = inner.pending_connect.take() {
                        abort.cancel();
                    }
                    changes.extend(shared.set_state(&mut inner, ConnectionState::Closing));
                    changes.extend(shared.set_state(&mut inner, ConnectionState::Disconnected));
                    info!("Aborted pending relay connection to {}", inner.url);
                    Teardown::Done
                }
                ConnectionState::Connected => {
                    changes.extend(shared.set_state(&mut inner, ConnectionState::Closing));
                    // Dropping the sender lets the writer flush and send a close frame
                    inner.outbound = None;
                    Teardown::Close {
                        writer: inner.writer.take(),
                        reader: inner.reader.take(),
                        generation: inner.generation,
                    }
                }
            }
        };
        shared.publish(changes);

        match teardown {
            Teardown::Done => Ok(()),
            Teardown::WaitForOtherCaller => {
                let mut state_rx = shared.state_tx.subscribe();
                let _ = state_rx
                    .wait_for(|state| *state != ConnectionState::Closing)
                    .await;
                Ok(())
            }
            Teardown::Close {
                writer,
                reader,
                generation,
            } => {
                if let Some(writer) = writer {
                    let abort = writer.abort_handle();
                    if tokio::time::timeout(shared.config.close_timeout, writer)
                        .await
                        .is_err()
                    {
                        warn!("Relay close handshake timed out");
                        abort.abort();
                    }
                }
                if let Some(reader) = reader {
                    reader.abort();
                }

                let event = {
                    let mut inner = shared.inner.lock();
                    if inner.generation == generation && inner.state == ConnectionState::Closing {
                        shared.set_state(&mut inner, ConnectionState::Disconnected)
                    } else {
                        None
                    }
                };
                shared.publish(event);

                info!("Disconnected from processing backend");
                Ok(())
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    fn stats(&self) -> RelayStats {
        let counters = &self.shared.counters;
        RelayStats {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            results_received: counters.results_received.load(Ordering::Relaxed),
            invalid_results: counters.invalid_results.load(Ordering::Relaxed),
            transport_errors: counters.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Resets a `connect()` whose caller dropped the future mid-handshake
struct PendingConnect {
    shared: Arc<RelayShared>,
    generation: u64,
    url: String,
    armed: bool,
}

impl PendingConnect {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let change = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != self.generation || inner.state != ConnectionState::Connecting {
                return;
            }
            if let Some(abort) = inner.pending_connect.take() {
                abort.cancel();
            }
            self.shared.set_state(&mut inner, ConnectionState::Disconnected)
        };

        warn!("Relay connect to {} abandoned by caller", self.url);
        self.shared.publish(change);
    }
}

/// WebSocket write task
async fn write_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<RelayShared>,
    generation: u64,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write.send(message).await {
            shared.fail_transport(generation, format!("send failed: {}", e));
            debug!("Relay write task ended after send failure");
            return;
        }
    }

    // Sender dropped: either disconnect() or a transport failure
    if let Err(e) = write.close().await {
        debug!("Relay close frame not delivered: {}", e);
    }
    debug!("Relay write task ended");
}

/// WebSocket read task
async fn read_task(mut read: SplitStream<WsStream>, shared: Arc<RelayShared>, generation: u64) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => shared.handle_inbound(generation, text.as_str()),
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {}-byte binary frame from backend", data.len());
            }
            Ok(Message::Close(frame)) => {
                let reason = match frame {
                    Some(frame) => format!(
                        "closed by backend ({}): {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    ),
                    None => "closed by backend".to_string(),
                };
                shared.fail_transport(generation, reason);
                return;
            }
            // Ping/pong replies are handled by tungstenite
            Ok(_) => {}
            Err(e) => {
                shared.fail_transport(generation, e.to_string());
                return;
            }
        }
    }

    shared.fail_transport(generation, "connection closed".to_string());
}
