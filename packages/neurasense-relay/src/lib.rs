pub mod cli;
pub mod config;
pub mod db;
pub mod streaming;

pub use config::{ConfigError, RelayConfig};
pub use db::{
    InMemorySessionStore, PatientRecord, RawData, SessionRecord, SessionStore, SqliteSessionStore,
    StoreError, StoreResult,
};
pub use streaming::{
    attach_render_sink, ConnectionState, EventKind, EventRouter, PipelineEvent, ProcessedResult,
    RelayClient, RelayClientConfig, RelayLink, RenderSink, RenderSubscription, SampleBatch,
    SessionConfig, SessionCoordinator, UdpSampleSource, WaveformBuffer,
};
