//! Observability snapshot
//!
//! The engine overwrites [`DiagnosticState`] and publishes it on a watch
//! channel. Nothing in the control path reads it back.

use crate::latency::PredictionModel;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Probabilities averaged for `avg_vad_prob`
const PROBABILITY_WINDOW: usize = 50;

/// Last network action taken for captured audio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEvent {
    #[default]
    Idle,
    Normal,
    Flush,
}

/// Percentage of sent phrases answered; 100 when nothing was sent
pub fn efficiency_ratio(sent: u64, received: u64) -> u32 {
    if sent == 0 {
        100
    } else {
        ((received as f64 / sent as f64) * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub sent_phrases: u64,
    pub received_phrases: u64,
    pub queue_length: usize,
    pub in_flight: usize,
    /// Chunks waiting in the playout scheduler
    pub out_queue: usize,
    pub buffer_gap: f64,
    pub efficiency_ratio: u32,
    pub last_sent_duration_ms: u64,
    pub model: PredictionModel,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticState {
    // audio
    pub rms: f32,
    pub frames_processed: u64,
    pub sample_rate: u32,
    pub volume_gain: f32,

    // turn logic
    pub vad_prob: f32,
    pub avg_vad_prob: f32,
    pub vad_threshold: f32,
    pub is_speaking: bool,
    pub is_buffering: bool,
    pub buffer_size: usize,
    pub silence_duration_ms: u64,
    pub silence_tolerance_ms: u64,
    pub effective_min_duration_ms: u64,
    pub current_latency: f64,
    pub active_mode: String,
    pub phase: String,

    // timing and queues
    pub buffer_gap: f64,
    pub busy_remaining_ms: u64,
    pub queue_length: usize,
    pub in_flight_count: usize,
    pub connecting_buffer_size: usize,
    pub auto_sleep_countdown: u64,
    pub time_since_last_speech_ms: u64,
    pub rtt_ms: u64,

    // network
    pub network_event: NetworkEvent,
    pub server_rx: bool,
    pub ws_state: String,

    pub queue: QueueStats,
}

/// Write side of the diagnostics channel
#[derive(Debug)]
pub struct DiagnosticsSink {
    state: DiagnosticState,
    probabilities: VecDeque<f32>,
    tx: watch::Sender<DiagnosticState>,
}

impl DiagnosticsSink {
    pub fn new() -> (Self, watch::Receiver<DiagnosticState>) {
        let state = DiagnosticState {
            ws_state: "CLOSED".to_string(),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(state.clone());
        (
            Self {
                state,
                probabilities: VecDeque::with_capacity(PROBABILITY_WINDOW),
                tx,
            },
            rx,
        )
    }

    /// Record a frame probability and refresh the running average
    pub fn record_probability(&mut self, probability: f32) {
        if self.probabilities.len() == PROBABILITY_WINDOW {
            self.probabilities.pop_front();
        }
        self.probabilities.push_back(probability);
        self.state.vad_prob = probability;
        self.state.avg_vad_prob =
            self.probabilities.iter().sum::<f32>() / self.probabilities.len() as f32;
    }

    pub fn update<F: FnOnce(&mut DiagnosticState)>(&mut self, f: F) {
        f(&mut self.state);
    }

    /// Push the current snapshot to every subscriber
    pub fn publish(&self) {
        self.tx.send_replace(self.state.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<DiagnosticState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_efficiency_ratio() {
        assert_eq!(efficiency_ratio(0, 0), 100);
        assert_eq!(efficiency_ratio(4, 3), 75);
        assert_eq!(efficiency_ratio(3, 2), 67);
    }

    #[test]
    fn test_average_over_last_fifty() {
        let (mut sink, _rx) = DiagnosticsSink::new();
        for _ in 0..50 {
            sink.record_probability(0.0);
        }
        for _ in 0..25 {
            sink.record_probability(1.0);
        }
        sink.publish();
        let rx = sink.subscribe();
        let snapshot = rx.borrow();
        assert!((snapshot.avg_vad_prob - 0.5).abs() < 1e-6);
        assert_eq!(snapshot.vad_prob, 1.0);
    }

    #[test]
    fn test_publish_reaches_receiver() {
        let (mut sink, rx) = DiagnosticsSink::new();
        assert_eq!(rx.borrow().ws_state, "CLOSED");
        sink.update(|s| {
            s.ws_state = "OPEN".to_string();
            s.network_event = NetworkEvent::Flush;
        });
        sink.publish();
        assert_eq!(rx.borrow().ws_state, "OPEN");
        assert_eq!(rx.borrow().network_event, NetworkEvent::Flush);
    }
}
