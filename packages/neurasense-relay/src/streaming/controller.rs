// Session coordinator - drives one recording session at a time
//
// The coordinator manages:
// - Sample source lifecycle (bind on start, release on end)
// - Relay connection lifecycle (connect on start, close on end)
// - The upstream forwarder (sampleReceived -> relay.send)
// - The session record (opened on start, persisted on end)
//
// It never inspects sample payloads.

use crate::db::{SessionRecord, SessionStore};
use crate::streaming::{
    relay::RelayLink,
    router::{EventKind, EventRouter, HandlerId, PipelineEvent},
    source::SampleSource,
    types::{
        ConnectionState, PipelineStats, RelayEnvelope, RelayError, SessionError, SessionResult,
    },
};
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Session coordinator configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub udp_host: String,
    pub udp_port: u16,
    pub backend_url: String,
    /// Keep the session running locally when the backend is unreachable
    pub allow_offline: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_host: "127.0.0.1".to_string(),
            udp_port: 12345,
            backend_url: "ws://localhost:8000/ws".to_string(),
            allow_offline: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active(SessionRecord),
}

/// Teardown steps run by [`SessionCoordinator::end`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    StopSource,
    DisconnectRelay,
    PersistRecord,
}

impl std::fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownStep::StopSource => write!(f, "stop sample source"),
            TeardownStep::DisconnectRelay => write!(f, "disconnect relay"),
            TeardownStep::PersistRecord => write!(f, "persist session record"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub message: String,
}

/// Outcome of ending a session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Finalized record; `id` is set when it was persisted
    pub record: SessionRecord,
    pub failures: Vec<TeardownFailure>,
}

impl SessionSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, step: TeardownStep) -> bool {
        self.failures.iter().any(|failure| failure.step == step)
    }
}

pub struct SessionCoordinator {
    config: SessionConfig,
    router: EventRouter,

    // Components
    source: Box<dyn SampleSource>,
    relay: Arc<dyn RelayLink>,
    store: Arc<dyn SessionStore>,

    // State
    state: SessionState,
    forwarder: Option<HandlerId>,
    simulation: Arc<AtomicBool>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        router: EventRouter,
        source: Box<dyn SampleSource>,
        relay: Arc<dyn RelayLink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            router,
            source,
            relay,
            store,
            state: SessionState::Idle,
            forwarder: None,
            simulation: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a session: bind the source, open the relay, start forwarding.
    pub async fn start(&mut self, patient_id: &str) -> SessionResult<SessionRecord> {
        if let SessionState::Active(record) = &self.state {
            warn!(
                "Session for patient {} already active, ignoring start",
                record.patient_id
            );
            return Err(SessionError::AlreadyActive);
        }

        info!("Starting session for patient {}", patient_id);

        let local_addr = self
            .source
            .start(self.config.udp_port, &self.config.udp_host)
            .await?;

        if let Err(e) = self.relay.connect(&self.config.backend_url).await {
            if self.config.allow_offline {
                warn!(
                    "Backend at {} unreachable ({}), session continues offline",
                    self.config.backend_url, e
                );
            } else {
                error!(
                    "Backend at {} unreachable ({}), aborting session start",
                    self.config.backend_url, e
                );
                match self.source.stop() {
                    Ok(handle) => handle.closed().await,
                    Err(stop_err) => error!("Failed to release {}: {}", local_addr, stop_err),
                }
                return Err(SessionError::Relay(e));
            }
        }

        self.forwarder = Some(self.register_forwarder());

        let record = SessionRecord::open(patient_id, Utc::now());
        self.state = SessionState::Active(record.clone());

        info!(
            "Session started: listening on {}, relay {}",
            local_addr,
            self.relay.state()
        );
        Ok(record)
    }

    /// End the active session.
    ///
    /// Stopping the source, disconnecting the relay and persisting the record
    /// are each attempted regardless of earlier failures.
    pub async fn end(&mut self) -> SessionResult<SessionSummary> {
        let mut record = match std::mem::take(&mut self.state) {
            SessionState::Active(record) => record,
            SessionState::Idle => return Err(SessionError::NotActive),
        };

        info!("Ending session for patient {}", record.patient_id);

        if let Some(id) = self.forwarder.take() {
            self.router.off(EventKind::SampleReceived, id);
        }

        let mut failures = Vec::new();

        match self.source.stop() {
            Ok(handle) => handle.closed().await,
            Err(e) => {
                error!("Teardown: failed to stop sample source: {}", e);
                failures.push(TeardownFailure {
                    step: TeardownStep::StopSource,
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = self.relay.disconnect().await {
            error!("Teardown: failed to disconnect relay: {}", e);
            failures.push(TeardownFailure {
                step: TeardownStep::DisconnectRelay,
                message: e.to_string(),
            });
        }

        let ended_at = Utc::now();
        record.finalize(ended_at);

        match self
            .store
            .add_session_record(
                &record.patient_id,
                record.started_at,
                ended_at,
                Some(record.raw.clone()),
            )
            .await
        {
            Ok(id) => record.id = Some(id),
            Err(e) => {
                error!("Teardown: failed to persist session record: {}", e);
                failures.push(TeardownFailure {
                    step: TeardownStep::PersistRecord,
                    message: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            info!("Session ended cleanly");
        } else {
            warn!("Session ended with {} teardown failure(s)", failures.len());
        }

        Ok(SessionSummary { record, failures })
    }

    /// Re-open the relay during an active session
    pub async fn reconnect_relay(&mut self) -> SessionResult<()> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }

        info!("Reconnecting relay to {}", self.config.backend_url);
        self.relay.connect(&self.config.backend_url).await?;
        Ok(())
    }

    /// Mark outbound frames as simulated (`isPhantom`)
    pub fn set_simulation(&self, enabled: bool) {
        self.simulation.store(enabled, Ordering::Relaxed);
        info!("Simulation mode {}", if enabled { "on" } else { "off" });
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    pub fn relay_state(&self) -> ConnectionState {
        self.relay.state()
    }

    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.source.local_addr()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            source: self.source.stats(),
            relay: self.relay.stats(),
        }
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    fn register_forwarder(&self) -> HandlerId {
        let relay = Arc::clone(&self.relay);
        let simulation = Arc::clone(&self.simulation);

        self.router.on(EventKind::SampleReceived, move |event| {
            let PipelineEvent::SampleReceived(batch) = event else {
                return Ok(());
            };
            let envelope =
                RelayEnvelope::new(Arc::clone(batch), simulation.load(Ordering::Relaxed));
            match relay.send(envelope) {
                // Dropped while not connected; the relay already logged it
                Ok(_) | Err(RelayError::NotConnected) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemorySessionStore, PatientRecord};
    use crate::streaming::source::StopHandle;
    use crate::streaming::types::{AdapterError, AdapterResult, RelayResult, SampleBatch};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct SourceProbe {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_bind: AtomicBool,
        fail_stop: AtomicBool,
    }

    struct MockSource {
        probe: Arc<SourceProbe>,
        bound: Option<SocketAddr>,
    }

    #[async_trait]
    impl SampleSource for MockSource {
        async fn start(&mut self, port: u16, host: &str) -> AdapterResult<SocketAddr> {
            self.probe.starts.fetch_add(1, Ordering::SeqCst);
            if self.probe.fail_bind.load(Ordering::SeqCst) {
                return Err(AdapterError::Bind(format!("{}:{}: address in use", host, port)));
            }
            let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
            self.bound = Some(addr);
            Ok(addr)
        }

        fn stop(&mut self) -> AdapterResult<StopHandle> {
            self.probe.stops.fetch_add(1, Ordering::SeqCst);
            self.bound = None;
            if self.probe.fail_stop.load(Ordering::SeqCst) {
                return Err(AdapterError::Stop("socket wedged".to_string()));
            }
            Ok(StopHandle::already_closed())
        }

        fn is_running(&self) -> bool {
            self.bound.is_some()
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            self.bound
        }
    }

    #[derive(Default)]
    struct MockRelay {
        state: Mutex<ConnectionState>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        fail_connect: AtomicBool,
        sent: Mutex<Vec<RelayEnvelope>>,
    }

    #[async_trait]
    impl RelayLink for MockRelay {
        async fn connect(&self, url: &str) -> RelayResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(RelayError::Connect(format!("{}: connection refused", url)));
            }
            *self.state.lock() = ConnectionState::Connected;
            Ok(())
        }

        fn send(&self, envelope: RelayEnvelope) -> RelayResult<u64> {
            if *self.state.lock() != ConnectionState::Connected {
                return Err(RelayError::NotConnected);
            }
            let mut sent = self.sent.lock();
            sent.push(envelope);
            Ok(sent.len() as u64)
        }

        async fn disconnect(&self) -> RelayResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = ConnectionState::Disconnected;
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock()
        }
    }

    struct Harness {
        coordinator: SessionCoordinator,
        router: EventRouter,
        source: Arc<SourceProbe>,
        relay: Arc<MockRelay>,
        store: Arc<InMemorySessionStore>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let router = EventRouter::new();
        let source = Arc::new(SourceProbe::default());
        let relay = Arc::new(MockRelay::default());
        let store = Arc::new(InMemorySessionStore::new());
        store.add_patient(PatientRecord::new(
            "1001",
            "Jane Doe",
            NaiveDate::from_ymd_opt(1980, 4, 12).unwrap(),
        ));

        let coordinator = SessionCoordinator::new(
            config,
            router.clone(),
            Box::new(MockSource {
                probe: Arc::clone(&source),
                bound: None,
            }),
            relay.clone(),
            store.clone(),
        );

        Harness {
            coordinator,
            router,
            source,
            relay,
            store,
        }
    }

    fn sample(value: f64) -> PipelineEvent {
        PipelineEvent::SampleReceived(Arc::new(SampleBatch::new(vec![vec![value]])))
    }

    #[tokio::test]
    async fn test_start_while_active_does_not_rebind() {
        let mut h = harness(SessionConfig::default());

        let record = h.coordinator.start("1001").await.unwrap();
        assert!(record.is_open());
        assert!(h.coordinator.is_active());

        assert!(matches!(
            h.coordinator.start("1001").await,
            Err(SessionError::AlreadyActive)
        ));
        assert_eq!(h.source.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.relay.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_start() {
        let mut h = harness(SessionConfig::default());
        h.source.fail_bind.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.coordinator.start("1001").await,
            Err(SessionError::Source(AdapterError::Bind(_)))
        ));
        assert!(!h.coordinator.is_active());
        assert_eq!(h.relay.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_relay_failure_releases_source() {
        let mut h = harness(SessionConfig::default());
        h.relay.fail_connect.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.coordinator.start("1001").await,
            Err(SessionError::Relay(RelayError::Connect(_)))
        ));
        assert!(!h.coordinator.is_active());
        assert_eq!(h.source.stops.load(Ordering::SeqCst), 1);
        assert!(h.coordinator.source_addr().is_none());
        assert_eq!(h.router.handler_count(EventKind::SampleReceived), 0);
    }

    #[tokio::test]
    async fn test_offline_session_allowed_when_configured() {
        let mut h = harness(SessionConfig {
            allow_offline: true,
            ..Default::default()
        });
        h.relay.fail_connect.store(true, Ordering::SeqCst);

        h.coordinator.start("1001").await.unwrap();
        assert!(h.coordinator.is_active());
        assert_eq!(h.coordinator.relay_state(), ConnectionState::Disconnected);

        // Samples are dropped, not errors
        assert_eq!(h.router.emit(sample(1.0)), 1);
        assert!(h.relay.sent.lock().is_empty());
        assert_eq!(h.router.failed_deliveries(), 0);
    }

    #[tokio::test]
    async fn test_forwarding_follows_simulation_flag() {
        let mut h = harness(SessionConfig::default());
        h.coordinator.start("1001").await.unwrap();

        h.router.emit(sample(1.0));
        h.coordinator.set_simulation(true);
        h.router.emit(sample(2.0));

        {
            let sent = h.relay.sent.lock();
            assert_eq!(sent.len(), 2);
            assert!(!sent[0].is_phantom);
            assert!(sent[1].is_phantom);
            assert_eq!(sent[1].packet.channels(), &[vec![2.0]]);
        }

        h.coordinator.end().await.unwrap();

        // Forwarder is gone once the session ends
        h.router.emit(sample(3.0));
        assert_eq!(h.relay.sent.lock().len(), 2);
        assert_eq!(h.router.handler_count(EventKind::SampleReceived), 0);
    }

    #[tokio::test]
    async fn test_end_persists_record() {
        let mut h = harness(SessionConfig::default());
        let started = h.coordinator.start("1001").await.unwrap();

        let summary = h.coordinator.end().await.unwrap();
        assert!(summary.is_clean());
        assert!(summary.record.id.is_some());
        assert!(!summary.record.is_open());
        assert_eq!(summary.record.started_at, started.started_at);

        let stored = h.store.sessions_for_patient("1001").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, summary.record.id);
        assert!(!h.coordinator.is_active());
        assert_eq!(h.coordinator.relay_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_end_with_failing_stop_still_tears_down() {
        let mut h = harness(SessionConfig::default());
        h.coordinator.start("1001").await.unwrap();
        h.source.fail_stop.store(true, Ordering::SeqCst);

        let summary = h.coordinator.end().await.unwrap();

        assert!(summary.failed(TeardownStep::StopSource));
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(h.relay.disconnects.load(Ordering::SeqCst), 1);
        assert!(summary.record.id.is_some());
        assert_eq!(h.store.all_sessions().len(), 1);
        assert!(!h.coordinator.is_active());
    }

    #[tokio::test]
    async fn test_persist_failure_reported() {
        let mut h = harness(SessionConfig::default());
        h.coordinator.start("unknown-patient").await.unwrap();

        let summary = h.coordinator.end().await.unwrap();
        assert!(summary.failed(TeardownStep::PersistRecord));
        assert!(summary.record.id.is_none());
        assert_eq!(h.relay.disconnects.load(Ordering::SeqCst), 1);
        assert!(!h.coordinator.is_active());
    }

    #[tokio::test]
    async fn test_end_and_reconnect_require_active_session() {
        let mut h = harness(SessionConfig::default());

        assert!(matches!(
            h.coordinator.end().await,
            Err(SessionError::NotActive)
        ));
        assert!(matches!(
            h.coordinator.reconnect_relay().await,
            Err(SessionError::NotActive)
        ));

        h.coordinator.start("1001").await.unwrap();
        h.relay.disconnect().await.unwrap();
        h.coordinator.reconnect_relay().await.unwrap();
        assert_eq!(h.relay.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.coordinator.relay_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_new_session_after_end() {
        let mut h = harness(SessionConfig::default());

        h.coordinator.start("1001").await.unwrap();
        h.coordinator.end().await.unwrap();
        h.coordinator.start("1001").await.unwrap();
        h.coordinator.end().await.unwrap();

        assert_eq!(h.source.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.all_sessions().len(), 2);
    }
}
