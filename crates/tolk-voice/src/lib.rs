//! # Tolk Voice - Live Interpretation Engine
//!
//! Real-time turn-taking and flow control for simultaneous interpretation over a
//! live speech-to-speech session. Microphone speech is segmented into turns and
//! streamed out; the translated voice streams back and is played with adaptive
//! rate so the buffer neither starves nor drifts. While the remote voice plays,
//! outbound audio is held locally and burst out when playback ends.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Live Engine                             │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────┐               │
//! │  │  Audio In  │→ │  VAD Probe │→ │ Turn Machine │──┐            │
//! │  │   (cpal)   │  │  (webrtc)  │  │ + hybrid buf │  │ Transmit   │
//! │  └────────────┘  └────────────┘  └──────────────┘  ↓            │
//! │        Turn Queue ← finalize      Response Timer  Live Session  │
//! │        (FIFO)                     (RTT model)     (websocket)   │
//! │                                                      │          │
//! │  ┌────────────┐   Started / Idle   ┌──────────────┐  │ chunks   │
//! │  │ Audio Out  │ ─────────────────→ │   Playout    │←─┘          │
//! │  │  (rodio)   │ ←───── chunks ──── │  Scheduler   │             │
//! │  └────────────┘                    └──────────────┘             │
//! │                 Background Monitor: standby / wake               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All control state lives in [`LiveEngine`]; audio threads and the transport
//! talk to it over channels.

pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod gemini;
pub mod latency;
pub mod monitor;
pub mod playout;
pub mod prompt;
pub mod queue;
pub mod session;
pub mod turn;
pub mod vad;

pub use audio::{AudioFrame, CaptureConfig, MicrophoneCapture, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
pub use config::{ActiveMode, LiveConfig};
pub use diagnostics::{DiagnosticState, NetworkEvent, QueueStats};
pub use engine::{ControlCommand, EngineChannels, EngineControl, EngineEvent, LiveEngine, TranscriptItem};
pub use error::{ErrorClass, VoiceError, VoiceResult};
pub use gemini::GeminiLiveTransport;
pub use latency::{LatencyPredictor, PredictionModel, ResponseTimer};
pub use monitor::{BackgroundMonitor, HandshakeGuard};
pub use playout::{spawn_playout, PlaybackEvent, PlayoutHandle, PlayoutScheduler, PlayoutStats};
pub use queue::TurnQueue;
pub use session::{
    AttemptId, ConnectRequest, SessionEvent, SessionHandle, SessionStatus, SessionTransport,
    TransportEvent,
};
pub use turn::{TurnConfig, TurnEvent, TurnPackage, TurnStateMachine};
pub use vad::{AnalyzedFrame, ProbeCommand, ProbeSender, ProbeWorker, SpeechClassifier, WebRtcClassifier};
