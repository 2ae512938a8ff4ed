//! Adaptive response-time prediction
//!
//! [`LatencyPredictor`] fits `rtt = m * duration + c` over the last 20 admitted
//! samples and pads predictions with two standard deviations of the residuals.
//! [`ResponseTimer`] owns the send log: it attributes round-trip times to the
//! oldest unconfirmed send and keeps the busy-until deadline.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sliding window length for the regression
pub const HISTORY_WINDOW: usize = 20;

/// Samples needed before the fit replaces the default model
pub const MIN_SAMPLES: usize = 3;

/// Inputs this short or shorter produce noisy timings and are not learned from
pub const MIN_TRAINING_DURATION_MS: f64 = 500.0;

/// Round trips above this are protocol anomalies, never data
pub const MAX_VALID_RTT_MS: f64 = 5000.0;

/// Slope bounds for the fitted processing rate
pub const MIN_PROCESSING_RATE: f64 = 0.1;
pub const MAX_PROCESSING_RATE: f64 = 5.0;

/// Linear response-time model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictionModel {
    /// Slope: response milliseconds per input millisecond
    pub processing_rate: f64,
    /// Intercept in milliseconds
    pub fixed_overhead_ms: f64,
    /// Two standard deviations of the fit residuals
    pub safety_margin_ms: f64,
    /// min(samples / 10, 1). Reported only.
    pub confidence: f64,
}

impl PredictionModel {
    pub const DEFAULT: PredictionModel = PredictionModel {
        processing_rate: 0.5,
        fixed_overhead_ms: 300.0,
        safety_margin_ms: 200.0,
        confidence: 0.0,
    };

    /// Expected wait for an input of this length, margin included
    pub fn predict(&self, input_duration_ms: f64) -> f64 {
        input_duration_ms * self.processing_rate + self.fixed_overhead_ms + self.safety_margin_ms
    }
}

impl Default for PredictionModel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One (input duration, observed round trip) observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    pub input_duration_ms: f64,
    pub rtt_ms: f64,
}

impl DataPoint {
    pub fn new(input_duration_ms: f64, rtt_ms: f64) -> Self {
        Self { input_duration_ms, rtt_ms }
    }
}

/// Least-squares fit over `history`, clamped to plausible values.
///
/// Returns [`PredictionModel::DEFAULT`] for fewer than three points or when all
/// inputs have the same length.
pub fn calculate_regression_model(history: &[DataPoint]) -> PredictionModel {
    if history.len() < MIN_SAMPLES {
        return PredictionModel::DEFAULT;
    }

    let n = history.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for p in history {
        sum_x += p.input_duration_ms;
        sum_y += p.rtt_ms;
        sum_xy += p.input_duration_ms * p.rtt_ms;
        sum_xx += p.input_duration_ms * p.input_duration_ms;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return PredictionModel::DEFAULT;
    }

    let m = (n * sum_xy - sum_x * sum_y) / denominator;
    let c = (sum_y - m * sum_x) / n;

    // residuals of the raw fit, before clamping
    let sum_sq: f64 = history
        .iter()
        .map(|p| {
            let residual = p.rtt_ms - (m * p.input_duration_ms + c);
            residual * residual
        })
        .sum();
    let std_dev = (sum_sq / n).sqrt();

    PredictionModel {
        processing_rate: m.clamp(MIN_PROCESSING_RATE, MAX_PROCESSING_RATE),
        fixed_overhead_ms: c.max(0.0),
        safety_margin_ms: 2.0 * std_dev,
        confidence: (n / 10.0).min(1.0),
    }
}

/// Online wrapper around the regression with admission rules
#[derive(Debug, Clone, Default)]
pub struct LatencyPredictor {
    history: VecDeque<DataPoint>,
    model: PredictionModel,
}

impl LatencyPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a sample; returns whether it was admitted to the training set
    pub fn record_sample(&mut self, input_duration_ms: f64, observed_rtt_ms: f64) -> bool {
        if observed_rtt_ms > MAX_VALID_RTT_MS || input_duration_ms <= MIN_TRAINING_DURATION_MS {
            debug!(input_duration_ms, observed_rtt_ms, "RTT sample not admitted");
            return false;
        }

        self.history.push_back(DataPoint::new(input_duration_ms, observed_rtt_ms));
        while self.history.len() > HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.model = calculate_regression_model(self.history.make_contiguous());
        debug!(
            rate = self.model.processing_rate,
            overhead_ms = self.model.fixed_overhead_ms,
            margin_ms = self.model.safety_margin_ms,
            "📈 Latency model updated"
        );
        true
    }

    /// Predicted wait in milliseconds for an input of this length
    pub fn predict(&self, input_duration_ms: f64) -> f64 {
        self.model.predict(input_duration_ms)
    }

    pub fn model(&self) -> PredictionModel {
        self.model
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.model = PredictionModel::DEFAULT;
    }
}

#[derive(Debug, Clone)]
struct SentTurn {
    id: String,
    duration_ms: u64,
    sent_at: Instant,
}

/// Send log, RTT attribution and the busy-until deadline
#[derive(Debug, Default)]
pub struct ResponseTimer {
    sent: VecDeque<SentTurn>,
    receiving: bool,
    predictor: LatencyPredictor,
    busy_until: Option<Instant>,
    latest_rtt: Option<Duration>,
    last_sent_duration_ms: u64,
}

impl ResponseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a turn went out and move the busy-until deadline
    pub fn track_sent(&mut self, id: &str, duration_ms: u64, now: Instant) {
        self.sent.push_back(SentTurn {
            id: id.to_string(),
            duration_ms,
            sent_at: now,
        });
        self.last_sent_duration_ms = duration_ms;

        let wait_ms = self.predictor.predict(duration_ms as f64).max(0.0);
        self.busy_until = Some(now + Duration::from_millis(wait_ms as u64));
    }

    /// Response audio arrived. Only the first chunk of a remote turn measures RTT;
    /// returns the attributed round trip when this was that chunk.
    pub fn on_response_chunk(&mut self, now: Instant) -> Option<Duration> {
        if self.receiving {
            return None;
        }
        self.receiving = true;

        let max_age = Duration::from_millis(MAX_VALID_RTT_MS as u64);
        while let Some(head) = self.sent.front() {
            if now.saturating_duration_since(head.sent_at) > max_age {
                debug!(turn = %head.id, "Expiring stale send from RTT log");
                self.sent.pop_front();
            } else {
                break;
            }
        }

        let oldest = self.sent.pop_front()?;
        let rtt = now.saturating_duration_since(oldest.sent_at);
        self.latest_rtt = Some(rtt);
        self.predictor
            .record_sample(oldest.duration_ms as f64, rtt.as_millis() as f64);
        debug!(turn = %oldest.id, rtt_ms = rtt.as_millis() as u64, "⏱️ RTT attributed");
        Some(rtt)
    }

    /// Remote turn finished. A turn that delivered no audio still consumes its send.
    pub fn on_turn_complete(&mut self) {
        if !self.receiving {
            self.sent.pop_front();
        }
        self.receiving = false;
    }

    /// Time left before the remote peer is expected to be done
    pub fn busy_remaining(&self, now: Instant) -> Duration {
        self.busy_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn is_busy(&self, now: Instant) -> bool {
        !self.busy_remaining(now).is_zero()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn latest_rtt(&self) -> Option<Duration> {
        self.latest_rtt
    }

    pub fn pending_sends(&self) -> usize {
        self.sent.len()
    }

    pub fn last_sent_duration_ms(&self) -> u64 {
        self.last_sent_duration_ms
    }

    pub fn predictor(&self) -> &LatencyPredictor {
        &self.predictor
    }

    /// Forget outstanding sends but keep the trained model
    pub fn clear_pending(&mut self) {
        self.sent.clear();
        self.receiving = false;
        self.busy_until = None;
    }

    pub fn reset(&mut self) {
        self.clear_pending();
        self.predictor.reset();
        self.latest_rtt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_perfectly_linear_history() {
        let history = [
            DataPoint::new(1000.0, 800.0),
            DataPoint::new(2000.0, 1300.0),
            DataPoint::new(3000.0, 1800.0),
        ];
        let model = calculate_regression_model(&history);
        assert!(approx(model.processing_rate, 0.5));
        assert!(approx(model.fixed_overhead_ms, 300.0));
        assert!(model.safety_margin_ms < 1e-6);
        assert!(approx(model.confidence, 0.3));
        assert!(approx(model.predict(4000.0), 2300.0));
    }

    #[test]
    fn test_degenerate_histories_use_default() {
        assert_eq!(calculate_regression_model(&[]), PredictionModel::DEFAULT);
        assert_eq!(
            calculate_regression_model(&[DataPoint::new(1000.0, 900.0), DataPoint::new(2000.0, 1000.0)]),
            PredictionModel::DEFAULT
        );
        let same_x = [
            DataPoint::new(1500.0, 700.0),
            DataPoint::new(1500.0, 900.0),
            DataPoint::new(1500.0, 1100.0),
        ];
        assert_eq!(calculate_regression_model(&same_x), PredictionModel::DEFAULT);
    }

    #[test]
    fn test_slope_and_intercept_clamps() {
        // Falling line: raw slope negative
        let falling = [
            DataPoint::new(1000.0, 3000.0),
            DataPoint::new(2000.0, 2000.0),
            DataPoint::new(3000.0, 1000.0),
        ];
        let model = calculate_regression_model(&falling);
        assert!(approx(model.processing_rate, MIN_PROCESSING_RATE));
        assert!(model.fixed_overhead_ms >= 0.0);

        // Steep line: raw slope 10, intercept strongly negative
        let steep = [
            DataPoint::new(600.0, 1000.0),
            DataPoint::new(700.0, 2000.0),
            DataPoint::new(800.0, 3000.0),
        ];
        let model = calculate_regression_model(&steep);
        assert!(approx(model.processing_rate, MAX_PROCESSING_RATE));
        assert!(approx(model.fixed_overhead_ms, 0.0));
    }

    #[test]
    fn test_confidence_saturates() {
        let history: Vec<DataPoint> = (0..15)
            .map(|i| DataPoint::new(600.0 + 100.0 * i as f64, 500.0 + 60.0 * i as f64))
            .collect();
        assert!(approx(calculate_regression_model(&history).confidence, 1.0));
    }

    #[test]
    fn test_admission_rules() {
        let mut predictor = LatencyPredictor::new();
        assert!(!predictor.record_sample(400.0, 900.0));
        assert!(!predictor.record_sample(500.0, 900.0));
        assert!(!predictor.record_sample(2000.0, 5001.0));
        assert!(predictor.record_sample(2000.0, 5000.0));
        assert_eq!(predictor.sample_count(), 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut predictor = LatencyPredictor::new();
        for i in 0..30 {
            predictor.record_sample(1000.0 + 10.0 * i as f64, 800.0 + 5.0 * i as f64);
        }
        assert_eq!(predictor.sample_count(), HISTORY_WINDOW);
        assert!(approx(predictor.model().processing_rate, 0.5));
    }

    #[test]
    fn test_rtt_attributed_to_oldest_send() {
        let mut timer = ResponseTimer::new();
        let t0 = Instant::now();
        timer.track_sent("turn-1", 1200, t0);
        timer.track_sent("turn-2", 900, t0 + Duration::from_millis(400));

        let rtt = timer.on_response_chunk(t0 + Duration::from_millis(1000)).unwrap();
        assert_eq!(rtt, Duration::from_millis(1000));
        // Later chunks of the same remote turn do not measure again
        assert!(timer.on_response_chunk(t0 + Duration::from_millis(1100)).is_none());
        assert_eq!(timer.pending_sends(), 1);

        timer.on_turn_complete();
        assert_eq!(timer.pending_sends(), 1);
        assert!(!timer.is_receiving());
    }

    #[test]
    fn test_stale_sends_expire() {
        let mut timer = ResponseTimer::new();
        let t0 = Instant::now();
        timer.track_sent("turn-1", 1200, t0);
        timer.track_sent("turn-2", 1200, t0 + Duration::from_millis(5500));

        let rtt = timer.on_response_chunk(t0 + Duration::from_millis(6000)).unwrap();
        assert_eq!(rtt, Duration::from_millis(500));
        assert_eq!(timer.pending_sends(), 0);
    }

    #[test]
    fn test_silent_turn_consumes_its_send() {
        let mut timer = ResponseTimer::new();
        let t0 = Instant::now();
        timer.track_sent("turn-1", 1200, t0);
        timer.on_turn_complete();
        assert_eq!(timer.pending_sends(), 0);
    }

    #[test]
    fn test_busy_until_uses_prediction() {
        let mut timer = ResponseTimer::new();
        let t0 = Instant::now();
        timer.track_sent("turn-1", 1000, t0);
        // default model: 1000 * 0.5 + 300 + 200
        assert_eq!(timer.busy_remaining(t0), Duration::from_millis(1000));
        assert!(timer.is_busy(t0 + Duration::from_millis(999)));
        assert!(!timer.is_busy(t0 + Duration::from_millis(1000)));
    }
}
