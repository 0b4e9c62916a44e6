// Render sink plumbing and the bounded waveform buffer
//
// Charts never subscribe to the router directly: `attach_render_sink` fans
// sample batches out per channel and forwards processed results and relay
// status. `WaveformBuffer` is the default sink; it keeps the most recent
// points of every channel for the display.

use crate::streaming::router::{EventKind, EventRouter, HandlerId, PipelineEvent};
use crate::streaming::types::{ConnectionState, ProcessedResult};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Points kept per channel by default
pub const DEFAULT_DISPLAY_POINTS: usize = 50;

/// Consumer of display data
pub trait RenderSink: Send + Sync {
    /// New samples for one channel, oldest first. Never called with an empty slice.
    fn on_sample_batch(&self, channel: usize, values: &[f64]);

    fn on_processed_result(&self, result: &ProcessedResult);

    /// Passive relay status indicator
    fn on_connection_state(&self, _state: ConnectionState) {}
}

/// Router registrations for one sink; dropping it detaches the sink
pub struct RenderSubscription {
    router: EventRouter,
    handlers: Vec<(EventKind, HandlerId)>,
}

impl RenderSubscription {
    pub fn detach(self) {}
}

impl Drop for RenderSubscription {
    fn drop(&mut self) {
        for (kind, id) in self.handlers.drain(..) {
            self.router.off(kind, id);
        }
    }
}

/// Wire a render sink to the router
pub fn attach_render_sink(router: &EventRouter, sink: Arc<dyn RenderSink>) -> RenderSubscription {
    let mut handlers = Vec::with_capacity(3);

    let samples = Arc::clone(&sink);
    let id = router.on(EventKind::SampleReceived, move |event| {
        if let PipelineEvent::SampleReceived(batch) = event {
            for (channel, values) in batch.channels().iter().enumerate() {
                if !values.is_empty() {
                    samples.on_sample_batch(channel, values);
                }
            }
        }
        Ok(())
    });
    handlers.push((EventKind::SampleReceived, id));

    let results = Arc::clone(&sink);
    let id = router.on(EventKind::ProcessedResultReceived, move |event| {
        if let PipelineEvent::ProcessedResultReceived(result) = event {
            results.on_processed_result(result);
        }
        Ok(())
    });
    handlers.push((EventKind::ProcessedResultReceived, id));

    let id = router.on(EventKind::ConnectionStateChanged, move |event| {
        if let PipelineEvent::ConnectionStateChanged { current, .. } = event {
            sink.on_connection_state(*current);
        }
        Ok(())
    });
    handlers.push((EventKind::ConnectionStateChanged, id));

    RenderSubscription {
        router: router.clone(),
        handlers,
    }
}

#[derive(Default)]
struct WaveformState {
    channels: Vec<VecDeque<f64>>,
    latest_result: Option<ProcessedResult>,
    results_seen: u64,
    relay_state: ConnectionState,
}

/// Ring buffer of the last `capacity` points per channel
pub struct WaveformBuffer {
    capacity: usize,
    state: RwLock<WaveformState>,
}

impl Default for WaveformBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_POINTS)
    }
}

impl WaveformBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(WaveformState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_channels(&self) -> usize {
        self.state.read().channels.len()
    }

    /// Snapshot of one channel, oldest first
    pub fn channel(&self, index: usize) -> Vec<f64> {
        self.state
            .read()
            .channels
            .get(index)
            .map(|points| points.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest_result(&self) -> Option<ProcessedResult> {
        self.state.read().latest_result.clone()
    }

    pub fn results_seen(&self) -> u64 {
        self.state.read().results_seen
    }

    pub fn relay_state(&self) -> ConnectionState {
        self.state.read().relay_state
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.channels.clear();
        state.latest_result = None;
        state.results_seen = 0;
    }
}

impl RenderSink for WaveformBuffer {
    fn on_sample_batch(&self, channel: usize, values: &[f64]) {
        let mut state = self.state.write();
        if state.channels.len() <= channel {
            state.channels.resize_with(channel + 1, VecDeque::new);
        }

        let points = &mut state.channels[channel];
        // Only the tail can survive
        let keep = values.len().min(self.capacity);
        points.extend(&values[values.len() - keep..]);
        while points.len() > self.capacity {
            points.pop_front();
        }
    }

    fn on_processed_result(&self, result: &ProcessedResult) {
        let mut state = self.state.write();
        state.latest_result = Some(result.clone());
        state.results_seen += 1;
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.state.write().relay_state = state;
    }
}
