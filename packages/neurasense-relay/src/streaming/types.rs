// Common types for the relay pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Result type for sample source operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Result type for relay client operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Result type for session coordinator operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by a sample source
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("UDP bind failed: {0}")]
    Bind(String),

    #[error("Sample source already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("Failed to stop sample source: {0}")]
    Stop(String),
}

/// Why a single datagram was rejected
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedSample {
    #[error("datagram is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("invalid sample JSON: {0}")]
    InvalidJson(String),

    #[error("datagram carries no channels")]
    NoChannels,

    #[error("expected {expected} channels, got {actual}")]
    ChannelCount { expected: usize, actual: usize },
}

/// Errors raised by the relay client
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay is not connected")]
    NotConnected,

    #[error("Relay connection attempt already in progress")]
    AlreadyConnecting,

    #[error("Relay connection is closing")]
    Closing,

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Timeout: no connection after {0} ms")]
    Timeout(u64),

    #[error("Connection attempt aborted by disconnect")]
    Aborted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the session coordinator
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A recording session is already active")]
    AlreadyActive,

    #[error("No recording session is active")]
    NotActive,

    #[error("Sample source error: {0}")]
    Source(#[from] AdapterError),

    #[error("Relay connect failed: {0}")]
    Relay(#[from] RelayError),
}

/// State of the relay connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// One decoded datagram of multi-channel samples.
///
/// `data[channel][sample]`, channels are positional. Serializes as
/// `{"timestamp": .., "data": [[..], ..]}` which is also the `packet` body of
/// an outbound relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    timestamp: f64,
    data: Vec<Vec<f64>>,
}

impl SampleBatch {
    /// Build a batch stamped with the current time
    pub fn new(data: Vec<Vec<f64>>) -> Self {
        Self::with_timestamp(data, unix_now())
    }

    pub fn with_timestamp(data: Vec<Vec<f64>>, timestamp: f64) -> Self {
        Self { timestamp, data }
    }

    /// Unix timestamp (seconds) when the datagram was received
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn channels(&self) -> &[Vec<f64>] {
        &self.data
    }

    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.data.get(index).map(Vec::as_slice)
    }

    pub fn num_channels(&self) -> usize {
        self.data.len()
    }

    /// Samples in the longest channel
    pub fn num_samples(&self) -> usize {
        self.data.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Outbound relay frame: `{"packet": <SampleBatch>, "isPhantom": <bool>}`
#[derive(Debug, Clone, Serialize)]
pub struct RelayEnvelope {
    pub packet: Arc<SampleBatch>,
    #[serde(rename = "isPhantom")]
    pub is_phantom: bool,
}

impl RelayEnvelope {
    pub fn new(packet: Arc<SampleBatch>, is_phantom: bool) -> Self {
        Self { packet, is_phantom }
    }
}

/// Metrics computed by the processing backend.
///
/// The backend owns the schema; this is an opaque JSON object with a few
/// typed accessors for the fields the monitor displays.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessedResult {
    metrics: Map<String, Value>,
}

impl ProcessedResult {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn metrics(&self) -> &Map<String, Value> {
        &self.metrics
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.metrics.get(name)
    }

    /// Numeric metric such as `DAR` or `RBP_Alpha`
    pub fn number(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(Value::as_f64)
    }

    /// Categorical metric such as `ratio_flag`
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metrics.get(name).and_then(Value::as_str)
    }

    /// Backend stroke flag; accepts a boolean or a 0/1 number
    pub fn stroke_risk(&self) -> Option<bool> {
        match self.metrics.get("stroke")? {
            Value::Bool(flag) => Some(*flag),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl From<Map<String, Value>> for ProcessedResult {
    fn from(metrics: Map<String, Value>) -> Self {
        Self { metrics }
    }
}

/// Payload of a `malformedSample` event
#[derive(Debug, Clone)]
pub struct MalformedSampleEvent {
    pub peer: SocketAddr,
    pub bytes: usize,
    pub error: MalformedSample,
}

/// Payload of a `relayError` event
#[derive(Debug, Clone, Serialize)]
pub struct RelayErrorEvent {
    pub url: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Counters kept by a sample source
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceStats {
    pub batches_received: u64,
    pub malformed_datagrams: u64,
    pub bytes_received: u64,
}

/// Counters kept by the relay client
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub results_received: u64,
    pub invalid_results: u64,
    pub transport_errors: u64,
}

/// Snapshot of the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineStats {
    pub source: SourceStats,
    pub relay: RelayStats,
}

/// Current Unix time in seconds
pub(crate) fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let batch = Arc::new(SampleBatch::with_timestamp(vec![vec![1.0, 2.0]], 10.5));
        let json = serde_json::to_value(RelayEnvelope::new(batch, true)).unwrap();

        assert_eq!(json["isPhantom"], Value::Bool(true));
        assert_eq!(json["packet"]["data"][0][1], serde_json::json!(2.0));
        assert_eq!(json["packet"]["timestamp"], serde_json::json!(10.5));
    }

    #[test]
    fn test_processed_result_accessors() {
        let result = ProcessedResult::from_json(
            r#"{"DAR": 1.25, "stroke": 1, "ratio_flag": "Normal", "hia_flag": "High"}"#,
        )
        .unwrap();

        assert_eq!(result.number("DAR"), Some(1.25));
        assert_eq!(result.label("ratio_flag"), Some("Normal"));
        assert_eq!(result.stroke_risk(), Some(true));
        assert_eq!(result.number("missing"), None);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_processed_result_requires_object() {
        assert!(ProcessedResult::from_json("[1, 2, 3]").is_err());
        assert!(ProcessedResult::from_json("\"HELLO\"").is_err());
    }

    #[test]
    fn test_batch_dimensions() {
        let batch = SampleBatch::new(vec![vec![1.0, 2.0, 3.0], vec![4.0]]);
        assert_eq!(batch.num_channels(), 2);
        assert_eq!(batch.num_samples(), 3);
        assert_eq!(batch.channel(1), Some(&[4.0][..]));
        assert!(batch.channel(2).is_none());
    }
}
