// Real-time relay pipeline
//
// Architecture:
// - `source`: pluggable sample sources (UDP datagrams from the acquisition bridge)
// - `router`: typed publish/subscribe hub all components talk through
// - `relay`: persistent WebSocket link to the processing backend
// - `controller`: session lifecycle (bind, connect, forward, persist)
// - `waveform`: render sink plumbing and the bounded display buffer

pub mod controller;
pub mod relay;
pub mod router;
pub mod source;
pub mod types;
pub mod waveform;

pub use controller::{
    SessionConfig, SessionCoordinator, SessionState, SessionSummary, TeardownFailure, TeardownStep,
};
pub use relay::{RelayClient, RelayClientConfig, RelayLink};
pub use router::{EventKind, EventRouter, HandlerId, HandlerResult, PipelineEvent};
pub use source::{decode_datagram, SampleSource, StopHandle, UdpSampleSource};
pub use types::{
    AdapterError, ConnectionState, MalformedSample, PipelineStats, ProcessedResult, RelayEnvelope,
    RelayError, SampleBatch, SessionError,
};
pub use waveform::{attach_render_sink, RenderSink, RenderSubscription, WaveformBuffer};
