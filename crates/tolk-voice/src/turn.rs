//! Turn-taking for a half-duplex remote peer
//!
//! The state machine segments analyzed frames into utterances using a hangover
//! window, and decides per frame whether audio goes out now or waits in the
//! hybrid buffer because the remote voice is playing locally. The held frames
//! leave as one burst when playback stops.

use crate::error::{VoiceError, VoiceResult};
use crate::vad::AnalyzedFrame;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Id carried by the package emitted at speech onset.
pub const TEMP_START_ID: &str = "temp-start";

/// Threshold boost while local playback is active (echo guard).
pub const PLAYBACK_THRESHOLD_BOOST: f32 = 0.2;

/// One detected utterance sent, or about to be sent, to the remote peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnPackage {
    /// `temp-start` at onset, `turn-{sequence}` once finalized
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub confidence_score: f32,
}

impl TurnPackage {
    fn onset(sequence: u64, confidence_score: f32) -> Self {
        Self {
            id: TEMP_START_ID.to_string(),
            sequence,
            timestamp: Utc::now(),
            duration_ms: 0,
            confidence_score,
        }
    }

    fn finalized(mut self, duration: Duration) -> Self {
        self.id = format!("turn-{}", self.sequence);
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Events emitted by the turn state machine, in capture order
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Probability crossed the effective threshold
    SpeechStarted { turn: TurnPackage },

    /// Hangover expired on an utterance longer than the minimum viable length
    UtteranceFinalized { turn: TurnPackage },

    /// Hangover expired on a blip too short to count
    UtteranceDiscarded { sequence: u64, duration: Duration },

    /// Audio to put on the wire. `burst` marks a hybrid-buffer flush.
    Transmit { samples: Vec<f32>, burst: bool, frames: usize },
}

/// Configuration for turn detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Speech probability threshold (default: 0.6)
    pub vad_threshold: f32,

    /// Hangover window before an utterance ends (default: 500ms)
    pub silence_tolerance: Duration,

    /// Utterances must be longer than this to count (default: 200ms)
    pub min_utterance: Duration,

    /// Capture sample rate, used to measure frame length (default: 16000 Hz)
    pub sample_rate: u32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.6,
            silence_tolerance: Duration::from_millis(500),
            min_utterance: Duration::from_millis(200),
            sample_rate: 16000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Speaking,
    SilentHangover,
}

/// Where the local side is in the micro-turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MicroTurnPhase {
    /// Frames stream out as they are captured
    Streaming,
    /// Utterance finished, remote peer is composing its response
    AwaitingResponse,
    /// Remote voice is playing locally; frames are held
    Holding,
}

/// Frames held while local playback is active
#[derive(Debug, Default)]
pub struct HybridBuffer {
    frames: Vec<Vec<f32>>,
}

impl HybridBuffer {
    pub fn push(&mut self, frame: Vec<f32>) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Concatenate every held frame in order and empty the buffer
    pub fn drain(&mut self) -> (Vec<f32>, usize) {
        let frames = self.frames.len();
        let mut out = Vec::with_capacity(self.sample_count());
        for frame in self.frames.drain(..) {
            out.extend_from_slice(&frame);
        }
        (out, frames)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Segments speech and gates transmission around local playback
pub struct TurnStateMachine {
    config: TurnConfig,
    state: TurnState,
    phase: MicroTurnPhase,
    playback_active: bool,

    phrase_start: Option<Instant>,
    last_speech: Option<Instant>,
    last_speech_frame: Duration,
    current: Option<TurnPackage>,
    sequence: u64,
    current_latency: Option<Duration>,

    buffer: HybridBuffer,

    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnStateMachine {
    /// Create a state machine and the receiver for its events
    pub fn new(config: TurnConfig) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let machine = Self {
            config,
            state: TurnState::Idle,
            phase: MicroTurnPhase::Streaming,
            playback_active: false,
            phrase_start: None,
            last_speech: None,
            last_speech_frame: Duration::ZERO,
            current: None,
            sequence: 0,
            current_latency: None,
            buffer: HybridBuffer::default(),
            event_tx,
        };

        (machine, event_rx)
    }

    /// Threshold a frame must exceed to count as speech right now
    pub fn effective_threshold(&self) -> f32 {
        if self.playback_active {
            self.config.vad_threshold + PLAYBACK_THRESHOLD_BOOST
        } else {
            self.config.vad_threshold
        }
    }

    /// Process one analyzed frame: segmentation first, then routing
    pub fn on_frame(&mut self, frame: AnalyzedFrame) -> VoiceResult<()> {
        let now = frame.captured_at;
        let is_speech = frame.probability > self.effective_threshold();
        let frame_len = self.frame_duration(frame.samples.len());

        match (self.state, is_speech) {
            (TurnState::Idle, true) => {
                self.sequence += 1;
                info!(sequence = self.sequence, probability = frame.probability, "🎤 Speech started");
                self.state = TurnState::Speaking;
                self.phrase_start = Some(now);
                self.last_speech = Some(now);
                self.last_speech_frame = frame_len;

                let turn = TurnPackage::onset(self.sequence, frame.probability);
                self.current = Some(turn.clone());
                self.emit(TurnEvent::SpeechStarted { turn })?;
            }

            (TurnState::Speaking | TurnState::SilentHangover, true) => {
                if self.state == TurnState::SilentHangover {
                    debug!("🎤 Speech resumed inside hangover window");
                }
                self.state = TurnState::Speaking;
                self.last_speech = Some(now);
                self.last_speech_frame = frame_len;
            }

            (TurnState::Speaking | TurnState::SilentHangover, false) => {
                self.state = TurnState::SilentHangover;
                let silence = self
                    .last_speech
                    .map(|last| now.saturating_duration_since(last))
                    .unwrap_or_default();
                if silence > self.config.silence_tolerance {
                    self.finish_utterance()?;
                }
            }

            (TurnState::Idle, false) => {}
        }

        self.route(frame.samples)
    }

    /// Update the local playback flag; a falling edge flushes the hybrid buffer
    pub fn set_playback_active(&mut self, active: bool) -> VoiceResult<()> {
        if self.playback_active == active {
            return Ok(());
        }
        self.playback_active = active;

        if active {
            debug!("🔇 Local playback active, holding outbound audio");
            self.phase = MicroTurnPhase::Holding;
            Ok(())
        } else {
            self.phase = MicroTurnPhase::Streaming;
            self.flush_buffer()
        }
    }

    /// Finalize the current utterance, if any
    fn finish_utterance(&mut self) -> VoiceResult<()> {
        let duration = match (self.phrase_start, self.last_speech) {
            (Some(start), Some(last)) => {
                last.saturating_duration_since(start) + self.last_speech_frame
            }
            _ => Duration::ZERO,
        };
        let turn = self.current.take();

        self.state = TurnState::Idle;
        self.phrase_start = None;

        let Some(turn) = turn else {
            return Ok(());
        };

        if duration > self.config.min_utterance {
            info!(sequence = turn.sequence, duration_ms = duration.as_millis() as u64, "✅ Utterance finalized");
            self.current_latency = Some(duration);
            if !self.playback_active {
                self.phase = MicroTurnPhase::AwaitingResponse;
            }
            self.emit(TurnEvent::UtteranceFinalized {
                turn: turn.finalized(duration),
            })
        } else {
            debug!("⏭️ Utterance too short ({:?}), ignoring", duration);
            self.emit(TurnEvent::UtteranceDiscarded {
                sequence: turn.sequence,
                duration,
            })
        }
    }

    /// Send now, or hold while the remote voice is playing
    fn route(&mut self, samples: Vec<f32>) -> VoiceResult<()> {
        if self.playback_active {
            self.buffer.push(samples);
            return Ok(());
        }
        if !self.buffer.is_empty() {
            self.flush_buffer()?;
        }
        self.emit(TurnEvent::Transmit {
            samples,
            burst: false,
            frames: 1,
        })
    }

    fn flush_buffer(&mut self) -> VoiceResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let (samples, frames) = self.buffer.drain();
        info!(frames, samples = samples.len(), "🚀 Flushing hybrid buffer");
        self.emit(TurnEvent::Transmit {
            samples,
            burst: true,
            frames,
        })
    }

    fn frame_duration(&self, samples: usize) -> Duration {
        Duration::from_nanos(samples as u64 * 1_000_000_000 / self.config.sample_rate.max(1) as u64)
    }

    /// Back to idle with nothing held; used when a capture session restarts
    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.phase = MicroTurnPhase::Streaming;
        self.playback_active = false;
        self.phrase_start = None;
        self.last_speech = None;
        self.current = None;
        self.current_latency = None;
        self.buffer.clear();
    }

    pub fn set_vad_threshold(&mut self, threshold: f32) {
        self.config.vad_threshold = threshold;
    }

    pub fn set_silence_tolerance(&mut self, tolerance: Duration) {
        self.config.silence_tolerance = tolerance;
    }

    /// Remote peer finished its response without any local playback
    pub fn note_response_complete(&mut self) {
        if self.phase == MicroTurnPhase::AwaitingResponse {
            self.phase = MicroTurnPhase::Streaming;
        }
    }

    fn emit(&self, event: TurnEvent) -> VoiceResult<()> {
        self.event_tx
            .send(event)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn is_speaking(&self) -> bool {
        self.state != TurnState::Idle
    }

    pub fn is_playback_active(&self) -> bool {
        self.playback_active
    }

    pub fn is_buffering(&self) -> bool {
        self.playback_active || !self.buffer.is_empty()
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn phase(&self) -> MicroTurnPhase {
        self.phase
    }

    pub fn last_speech(&self) -> Option<Instant> {
        self.last_speech
    }

    /// Length of the last real utterance
    pub fn current_latency(&self) -> Option<Duration> {
        self.current_latency
    }

    /// Get the current state (for testing/debugging)
    pub fn state(&self) -> &str {
        match self.state {
            TurnState::Idle => "idle",
            TurnState::Speaking => "speaking",
            TurnState::SilentHangover => "silent_hangover",
        }
    }
}
