//! Live engine - the single cooperative context
//!
//! Every piece of control state (turn machine, queue, response timer, monitor,
//! supervisor, connecting buffer) is owned here and mutated only from
//! [`LiveEngine::run`]. Other threads and tasks talk to it through channels:
//!
//! ```text
//!  probe worker ──AnalyzedFrame──┐
//!  playout driver ─PlaybackEvent─┤
//!  transport ───TransportEvent───┼──► LiveEngine ──► SessionHandle (send)
//!  connect task ─ConnectOutcome──┤         │
//!  timers ──────Scheduled────────┤         ├──► PlayoutHandle (enqueue/reset)
//!  EngineControl ─ControlCommand─┘         └──► EngineEvent / DiagnosticState
//! ```
//!
//! Timed steps (handshake cool-down and warm-up, retry backoff, mode settle)
//! are scheduled messages, so the loop itself never blocks.

use crate::audio::{decode_chunk_base64, encode_chunk_base64, CAPTURE_SAMPLE_RATE};
use crate::config::{ActiveMode, LiveConfig};
use crate::diagnostics::{efficiency_ratio, DiagnosticState, DiagnosticsSink, NetworkEvent, QueueStats};
use crate::error::{VoiceError, VoiceResult};
use crate::latency::ResponseTimer;
use crate::monitor::{ActivitySnapshot, BackgroundMonitor, MonitorDecision};
use crate::playout::{PlaybackEvent, PlayoutHandle, PlayoutStats};
use crate::prompt::system_instruction_for;
use crate::queue::TurnQueue;
use crate::session::{
    validate_api_key, AttemptId, ConnectRequest, ConnectionSupervisor, FailureAction,
    RetryTicket, SessionEvent, SessionHandle, SessionStatus, SessionTransport, TransportEvent,
};
use crate::turn::{TurnConfig, TurnEvent, TurnStateMachine};
use crate::vad::{AnalyzedFrame, ProbeCommand, ProbeSender};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Pause between tearing down the old session and connecting
pub const HANDSHAKE_COOLDOWN: Duration = Duration::from_millis(200);
/// Backend warm-up after a wake-up connect
pub const WAKE_WARMUP: Duration = Duration::from_millis(500);
/// Backend warm-up after a manual start
pub const START_WARMUP: Duration = Duration::from_millis(800);
/// Settle time between disconnect and restart on a mode change
pub const MODE_SETTLE: Duration = Duration::from_millis(100);

/// Monitor and diagnostics cadence
const TICK_INTERVAL: Duration = Duration::from_millis(200);
/// How long `server_rx` stays lit after a server message
const SERVER_RX_FLASH: Duration = Duration::from_millis(150);

/// One remote turn's running transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptItem {
    pub id: u64,
    /// Phrase group the response belongs to
    pub group_id: u64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set once the remote turn completed
    pub is_final: bool,
}

/// What the engine reports to its host
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusChanged(SessionStatus),
    /// Passive notice: waking up, starting, connected, reconnecting
    Notification(String),
    /// Condition that stopped progress
    Error(String),
    Transcript(TranscriptItem),
}

/// Commands accepted from the host
#[derive(Debug, Clone)]
pub enum ControlCommand {
    SetMode(ActiveMode),
    SetVadThreshold(f32),
    SetSilenceTolerance(Duration),
    SetVolumeGain(f32),
    SetOutputDevice(Option<String>),
    FlushQueue,
    Shutdown,
}

/// Cloneable handle for steering a running engine
#[derive(Debug, Clone)]
pub struct EngineControl {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl EngineControl {
    pub fn send(&self, command: ControlCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn set_mode(&self, mode: ActiveMode) -> VoiceResult<()> {
        self.send(ControlCommand::SetMode(mode))
    }

    pub fn set_vad_threshold(&self, threshold: f32) -> VoiceResult<()> {
        self.send(ControlCommand::SetVadThreshold(threshold))
    }

    pub fn set_silence_tolerance(&self, tolerance: Duration) -> VoiceResult<()> {
        self.send(ControlCommand::SetSilenceTolerance(tolerance))
    }

    pub fn set_volume_gain(&self, gain: f32) -> VoiceResult<()> {
        self.send(ControlCommand::SetVolumeGain(gain))
    }

    pub fn set_output_device(&self, device: Option<String>) -> VoiceResult<()> {
        self.send(ControlCommand::SetOutputDevice(device))
    }

    pub fn flush_queue(&self) -> VoiceResult<()> {
        self.send(ControlCommand::FlushQueue)
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(ControlCommand::Shutdown)
    }
}

/// Host-side ends of the engine's channels
pub struct EngineChannels {
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub diagnostics: watch::Receiver<DiagnosticState>,
    pub control: EngineControl,
}

/// Result of a spawned connect call
pub struct ConnectOutcome {
    pub attempt: AttemptId,
    pub result: VoiceResult<Box<dyn SessionHandle>>,
}

#[derive(Debug, Clone, Copy)]
enum Scheduled {
    Retry(RetryTicket),
    HandshakeConnect { epoch: u64, wakeup: bool },
    HandshakeReady { epoch: u64 },
    ModeStart { epoch: u64 },
}

#[derive(Debug, Clone, Copy)]
struct HandshakeAttempt {
    attempt: AttemptId,
    wakeup: bool,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Buffered,
    Dropped,
}

struct Inbox {
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    outcome_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    scheduled_rx: mpsc::UnboundedReceiver<Scheduled>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Turn-taking and flow-control engine
pub struct LiveEngine<T: SessionTransport + 'static> {
    config: LiveConfig,
    mode: ActiveMode,
    transport: Arc<T>,

    turns: TurnStateMachine,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    queue: TurnQueue,
    timer: ResponseTimer,
    monitor: BackgroundMonitor,
    supervisor: ConnectionSupervisor,
    last_status: SessionStatus,

    session: Option<Box<dyn SessionHandle>>,
    connecting_buffer: Vec<String>,
    handshake_epoch: u64,
    handshake_attempt: Option<HandshakeAttempt>,

    phrase_counter: u64,
    sent_phrases: u64,
    received_phrases: u64,
    transcript: Option<TranscriptItem>,
    transcript_seq: u64,

    playout: PlayoutHandle,
    playout_stats: PlayoutStats,
    probe: ProbeSender,

    diagnostics: DiagnosticsSink,
    network_event: NetworkEvent,
    frames_processed: u64,
    last_server_rx: Option<Instant>,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    outcome_tx: mpsc::UnboundedSender<ConnectOutcome>,
    scheduled_tx: mpsc::UnboundedSender<Scheduled>,
    inbox: Option<Inbox>,
}

impl<T: SessionTransport + 'static> LiveEngine<T> {
    pub fn new(
        config: LiveConfig,
        transport: Arc<T>,
        probe: ProbeSender,
        playout: PlayoutHandle,
    ) -> (Self, EngineChannels) {
        let (turns, turn_rx) = TurnStateMachine::new(TurnConfig {
            vad_threshold: config.vad_threshold,
            silence_tolerance: Duration::from_millis(config.silence_tolerance_ms),
            sample_rate: CAPTURE_SAMPLE_RATE,
            ..TurnConfig::default()
        });
        let (events_tx, events) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (scheduled_tx, scheduled_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (diagnostics, diagnostics_rx) = DiagnosticsSink::new();

        let engine = Self {
            mode: config.mode,
            monitor: BackgroundMonitor::new(Duration::from_secs(config.auto_sleep_secs), now()),
            config,
            transport,
            turns,
            turn_rx,
            queue: TurnQueue::new(),
            timer: ResponseTimer::new(),
            supervisor: ConnectionSupervisor::new(),
            last_status: SessionStatus::Disconnected,
            session: None,
            connecting_buffer: Vec::new(),
            handshake_epoch: 0,
            handshake_attempt: None,
            phrase_counter: 0,
            sent_phrases: 0,
            received_phrases: 0,
            transcript: None,
            transcript_seq: 0,
            playout,
            playout_stats: PlayoutStats::default(),
            probe,
            diagnostics,
            network_event: NetworkEvent::Idle,
            frames_processed: 0,
            last_server_rx: None,
            events_tx,
            transport_tx,
            outcome_tx,
            scheduled_tx,
            inbox: Some(Inbox {
                transport_rx,
                outcome_rx,
                scheduled_rx,
                control_rx,
            }),
        };

        let channels = EngineChannels {
            events,
            diagnostics: diagnostics_rx,
            control: EngineControl { tx: control_tx },
        };
        (engine, channels)
    }

    /// Run until capture ends or a shutdown command arrives
    pub async fn run(
        mut self,
        mut frames: mpsc::UnboundedReceiver<AnalyzedFrame>,
        mut playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) -> VoiceResult<()> {
        let Inbox {
            mut transport_rx,
            mut outcome_rx,
            mut scheduled_rx,
            mut control_rx,
        } = self
            .inbox
            .take()
            .ok_or_else(|| VoiceError::Unknown("Engine already running".to_string()))?;

        info!(mode = %self.mode, "🚀 Live engine started");
        if self.mode != ActiveMode::Off {
            self.start_session();
        }

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_analyzed_frame(frame),
                    None => {
                        info!("Capture ended");
                        break;
                    }
                },
                Some(event) = playback.recv() => self.on_playback_event(event),
                Some(event) = transport_rx.recv() => self.on_transport_event(event),
                Some(outcome) = outcome_rx.recv() => self.on_connect_outcome(outcome),
                Some(step) = scheduled_rx.recv() => self.on_scheduled(step),
                Some(command) = control_rx.recv() => {
                    if matches!(command, ControlCommand::Shutdown) {
                        break;
                    }
                    self.on_control(command);
                }
                _ = tick.tick() => self.on_monitor_tick(now()),
            }
        }

        self.disconnect_all();
        info!("🛑 Live engine stopped");
        Ok(())
    }

    // ── audio path ────────────────────────────────────────────────

    pub fn on_analyzed_frame(&mut self, frame: AnalyzedFrame) {
        self.frames_processed += 1;
        self.diagnostics.record_probability(frame.probability);
        let rms = frame.rms;
        self.diagnostics.update(|s| s.rms = rms);

        if self.mode == ActiveMode::Off {
            return;
        }
        if let Err(e) = self.turns.on_frame(frame) {
            error!("Turn state machine error: {}", e);
        }
        self.drain_turn_events();
    }

    fn drain_turn_events(&mut self) {
        while let Ok(event) = self.turn_rx.try_recv() {
            self.on_turn_event(event);
        }
    }

    fn on_turn_event(&mut self, event: TurnEvent) {
        let now = now();
        match event {
            TurnEvent::SpeechStarted { turn } => {
                self.monitor.note_speech(now);
                self.phrase_counter += 1;
                debug!(sequence = turn.sequence, phrase = self.phrase_counter, "Phrase started");
                if self.monitor.try_wake(self.mode, self.supervisor.status(), now) {
                    self.begin_handshake(true);
                }
            }
            TurnEvent::UtteranceFinalized { turn } => {
                self.monitor.note_speech(now);
                let id = turn.id.clone();
                let duration_ms = turn.duration_ms;
                self.queue.enqueue(turn);
                if self.can_send() && !self.turns.is_playback_active() {
                    self.queue.mark_sent(&id);
                    self.record_sent(&id, duration_ms, now);
                }
            }
            TurnEvent::UtteranceDiscarded { sequence, duration } => {
                debug!(sequence, ?duration, "Blip discarded");
            }
            TurnEvent::Transmit { samples, burst, frames } => {
                let chunk = encode_chunk_base64(&samples);
                let outcome = self.send_or_buffer(chunk);
                self.network_event = match outcome {
                    SendOutcome::Sent if burst => NetworkEvent::Flush,
                    SendOutcome::Sent => NetworkEvent::Normal,
                    SendOutcome::Buffered | SendOutcome::Dropped => NetworkEvent::Idle,
                };
                if burst && outcome == SendOutcome::Sent {
                    info!(frames, "🚀 Burst sent after playback");
                    self.flush_pending_turns(now);
                }
            }
        }
    }

    fn can_send(&self) -> bool {
        self.supervisor.status() == SessionStatus::Connected && self.session.is_some()
    }

    fn send_or_buffer(&mut self, chunk: String) -> SendOutcome {
        if self.can_send() {
            self.flush_connecting_buffer();
            self.send_chunk(&chunk);
            SendOutcome::Sent
        } else if matches!(
            self.supervisor.status(),
            SessionStatus::Connecting | SessionStatus::Connected
        ) || self.monitor.handshake().is_in_flight()
        {
            self.connecting_buffer.push(chunk);
            SendOutcome::Buffered
        } else {
            SendOutcome::Dropped
        }
    }

    fn send_chunk(&self, chunk: &str) {
        if let Some(session) = &self.session {
            if let Err(e) = session.send_audio(chunk) {
                warn!("Audio send failed: {}", e);
            }
        }
    }

    /// Flush audio held during connect, then account for the turns it carried
    fn flush_connecting_buffer(&mut self) {
        if self.connecting_buffer.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.connecting_buffer);
        info!(chunks = held.len(), "Flushing audio buffered while connecting");
        for chunk in &held {
            self.send_chunk(chunk);
        }
        self.flush_pending_turns(now());
    }

    fn flush_when_ready(&mut self) {
        if self.can_send() {
            self.flush_connecting_buffer();
        }
    }

    fn flush_pending_turns(&mut self, now: Instant) {
        for turn in self.queue.flush_all() {
            self.record_sent(&turn.id, turn.duration_ms, now);
        }
    }

    fn record_sent(&mut self, id: &str, duration_ms: u64, now: Instant) {
        self.timer.track_sent(id, duration_ms, now);
        self.sent_phrases += 1;
    }

    // ── playback ──────────────────────────────────────────────────

    pub fn on_playback_event(&mut self, event: PlaybackEvent) {
        let result = match event {
            PlaybackEvent::Started { group_id } => {
                debug!(group_id, "🔊 Remote voice playing");
                self.turns.set_playback_active(true)
            }
            PlaybackEvent::Idle => {
                debug!("🔊 Playback idle");
                self.turns.set_playback_active(false)
            }
            PlaybackEvent::Stats(stats) => {
                self.playout_stats = stats;
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Playback state update failed: {}", e);
        }
        self.drain_turn_events();
    }

    // ── transport ─────────────────────────────────────────────────

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent { attempt, event } = event;
        if !self.supervisor.is_current(attempt) {
            debug!(%attempt, ?event, "Ignoring event from stale attempt");
            return;
        }
        let now = now();
        self.last_server_rx = Some(now);

        match event {
            SessionEvent::Opened => {
                if self.supervisor.on_opened(attempt) {
                    self.sent_phrases = 0;
                    self.received_phrases = 0;
                    self.emit_status();
                    self.flush_when_ready();
                }
            }
            SessionEvent::ChunkReceived(data) => match decode_chunk_base64(&data) {
                Ok(pcm) => {
                    if let Some(rtt) = self.timer.on_response_chunk(now) {
                        debug!(rtt_ms = rtt.as_millis() as u64, "First response chunk");
                    }
                    if let Err(e) = self.playout.enqueue(pcm, self.phrase_counter) {
                        warn!("Playout unavailable: {}", e);
                    }
                }
                Err(e) => warn!("Dropping undecodable chunk: {}", e),
            },
            SessionEvent::TextDelta(text) => self.append_transcript(&text),
            SessionEvent::TurnComplete => {
                if self.queue.confirm_oldest() {
                    self.received_phrases += 1;
                }
                self.timer.on_turn_complete();
                self.turns.note_response_complete();
                self.close_transcript();
            }
            SessionEvent::Closed => {
                if self.supervisor.on_closed(attempt) {
                    self.session = None;
                    self.emit_status();
                }
            }
            SessionEvent::Error(message) => {
                let action = self.supervisor.on_session_error(attempt, &message);
                self.apply_failure(action);
            }
        }
    }

    pub fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome { attempt, result } = outcome;
        if !self.supervisor.is_current(attempt) {
            if let Ok(handle) = result {
                debug!(%attempt, "Closing session from a superseded attempt");
                handle.close();
            }
            return;
        }

        let handshake = self.handshake_attempt.filter(|h| h.attempt == attempt);
        match result {
            Ok(handle) => {
                self.session = Some(handle);
                self.flush_when_ready();
                if let Some(h) = handshake {
                    let warmup = if h.wakeup { WAKE_WARMUP } else { START_WARMUP };
                    self.schedule(warmup, Scheduled::HandshakeReady { epoch: h.epoch });
                }
            }
            Err(e) => {
                error!(%attempt, "Connect failed: {}", e);
                let action = self.supervisor.on_connect_failed(attempt, &e);
                if handshake.is_some() {
                    self.finish_handshake();
                }
                if matches!(action, FailureAction::Retry { .. }) {
                    self.emit(EngineEvent::Error(format!("Could not connect: {}", e)));
                }
                self.apply_failure(action);
            }
        }
    }

    fn apply_failure(&mut self, action: FailureAction) {
        match action {
            FailureAction::Ignore => {}
            FailureAction::Retry { ticket, delay, message } => {
                self.close_session();
                warn!(?delay, "Reconnecting after: {}", message);
                self.notify("Reconnecting...");
                self.schedule(delay, Scheduled::Retry(ticket));
                self.emit_status();
            }
            FailureAction::Surface { message } => {
                self.close_session();
                self.emit(EngineEvent::Error(format!("Connection error: {}", message)));
                self.emit_status();
            }
        }
        if self.supervisor.status() != SessionStatus::Connecting {
            self.drop_connecting_buffer();
        }
    }

    /// Start a connect attempt in the background
    fn start_connect(&mut self) -> Option<AttemptId> {
        let api_key = match validate_api_key(self.config.api_key.as_deref()).map(str::to_string) {
            Ok(key) => key,
            Err(e) => {
                error!("❌ {}", e);
                self.supervisor.auth_failed();
                self.emit(EngineEvent::Error(e.to_string()));
                self.emit_status();
                return None;
            }
        };

        self.close_session();
        let attempt = self.supervisor.begin_attempt();
        self.emit_status();

        let request = ConnectRequest {
            api_key,
            system_instruction: system_instruction_for(&self.config, self.mode),
            voice_name: self.config.voice_name.clone(),
            model: self.config.model.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let events = self.transport_tx.clone();
        let outcomes = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(request, attempt, events).await;
            let _ = outcomes.send(ConnectOutcome { attempt, result });
        });
        Some(attempt)
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    // ── handshake and modes ───────────────────────────────────────

    /// Manual start through the warm handshake; no-op while one is running
    fn start_session(&mut self) {
        if self.monitor.handshake_mut().try_begin(now()) {
            self.begin_handshake(false);
        }
    }

    /// Handshake claimed by the caller: tear down, cool down, connect, warm up
    fn begin_handshake(&mut self, wakeup: bool) {
        self.drop_connecting_buffer();
        self.handshake_epoch += 1;
        let epoch = self.handshake_epoch;
        if wakeup {
            info!("🌅 Waking up (warm handshake)");
            self.notify("Waking up...");
            self.monitor.manual_flush(&mut self.queue, &mut self.timer);
        } else {
            self.notify("Starting...");
        }

        self.close_session();
        self.supervisor.invalidate();
        self.emit_status();
        self.schedule(HANDSHAKE_COOLDOWN, Scheduled::HandshakeConnect { epoch, wakeup });
    }

    fn finish_handshake(&mut self) {
        self.monitor.handshake_mut().finish();
        self.handshake_attempt = None;
        if !self.can_send() && self.supervisor.status() != SessionStatus::Connecting {
            self.drop_connecting_buffer();
        }
    }

    /// Held audio only lives for one connect window
    fn drop_connecting_buffer(&mut self) {
        if !self.connecting_buffer.is_empty() {
            debug!(chunks = self.connecting_buffer.len(), "Dropping audio held for a connection that never opened");
            self.connecting_buffer.clear();
        }
    }

    fn on_scheduled(&mut self, step: Scheduled) {
        match step {
            Scheduled::Retry(ticket) => {
                if self.supervisor.take_retry(ticket) {
                    info!("🔄 Retrying connection");
                    self.start_connect();
                }
            }
            Scheduled::HandshakeConnect { epoch, wakeup } => {
                if epoch != self.handshake_epoch || !self.monitor.handshake().is_in_flight() {
                    return;
                }
                match self.start_connect() {
                    Some(attempt) => {
                        self.handshake_attempt = Some(HandshakeAttempt { attempt, wakeup, epoch });
                    }
                    None => self.finish_handshake(),
                }
            }
            Scheduled::HandshakeReady { epoch } => {
                if epoch != self.handshake_epoch {
                    return;
                }
                self.finish_handshake();
                info!("✅ Warm handshake complete");
                self.notify("Connected!");
            }
            Scheduled::ModeStart { epoch } => {
                if epoch != self.handshake_epoch || self.mode == ActiveMode::Off {
                    return;
                }
                self.reset_vad();
                self.start_session();
            }
        }
    }

    /// Switch mode: off tears everything down, other modes restart from scratch
    pub fn set_mode(&mut self, mode: ActiveMode) {
        info!(from = %self.mode, to = %mode, "🔄 Mode change");
        self.mode = mode;
        self.disconnect_all();
        if mode != ActiveMode::Off {
            self.schedule(MODE_SETTLE, Scheduled::ModeStart { epoch: self.handshake_epoch });
        }
    }

    fn disconnect_all(&mut self) {
        self.handshake_epoch += 1;
        self.close_session();
        self.supervisor.invalidate();
        if let Err(e) = self.playout.reset() {
            warn!("Playout reset failed: {}", e);
        }
        self.queue.clear();
        self.timer.reset();
        self.transcript = None;
        self.sent_phrases = 0;
        self.received_phrases = 0;
        self.phrase_counter = 0;
        self.connecting_buffer.clear();
        self.monitor.handshake_mut().finish();
        self.handshake_attempt = None;
        self.reset_vad();
        self.emit_status();
    }

    fn reset_vad(&mut self) {
        self.turns.reset();
        if let Err(e) = self.probe.send(ProbeCommand::Reset) {
            warn!("VAD reset failed: {}", e);
        }
    }

    fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetMode(mode) => self.set_mode(mode),
            ControlCommand::SetVadThreshold(threshold) => {
                if self.accept_setting(|c| c.vad_threshold = threshold) {
                    self.turns.set_vad_threshold(threshold);
                }
            }
            ControlCommand::SetSilenceTolerance(tolerance) => {
                let ms = tolerance.as_millis() as u64;
                if self.accept_setting(|c| c.silence_tolerance_ms = ms) {
                    self.turns.set_silence_tolerance(tolerance);
                }
            }
            ControlCommand::SetVolumeGain(gain) => {
                if self.accept_setting(|c| c.volume_gain = gain) {
                    if let Err(e) = self.probe.send(ProbeCommand::SetGain(gain)) {
                        warn!("Gain update failed: {}", e);
                    }
                }
            }
            ControlCommand::SetOutputDevice(device) => {
                self.config.output_device = device.clone();
                if let Err(e) = self.playout.set_output_device(device) {
                    warn!("Output device update failed: {}", e);
                }
            }
            ControlCommand::FlushQueue => {
                self.monitor.manual_flush(&mut self.queue, &mut self.timer);
            }
            ControlCommand::Shutdown => {}
        }
    }

    /// Apply a settings change if the result still validates
    fn accept_setting<F: FnOnce(&mut LiveConfig)>(&mut self, change: F) -> bool {
        let mut candidate = self.config.clone();
        change(&mut candidate);
        match candidate.validate() {
            Ok(()) => {
                self.config = candidate;
                true
            }
            Err(e) => {
                warn!("Rejected setting: {}", e);
                false
            }
        }
    }

    // ── monitor and observability ─────────────────────────────────

    pub fn on_monitor_tick(&mut self, now: Instant) {
        let snapshot = ActivitySnapshot {
            mode: self.mode,
            status: self.supervisor.status(),
            pending_turns: self.queue.len(),
            in_flight: self.queue.in_flight_count(),
            buffering: self.turns.is_buffering() || !self.connecting_buffer.is_empty(),
            remote_busy: self.timer.is_busy(now) || self.timer.is_receiving(),
        };

        match self.monitor.evaluate(&snapshot, now) {
            MonitorDecision::Stay => {}
            MonitorDecision::ExpireUnconfirmed => {
                let dropped = self.queue.clear();
                self.timer.clear_pending();
                warn!(dropped, "Peer never completed these turns, treating them as dropped");
            }
            MonitorDecision::Standby => {
                info!(idle_secs = self.monitor.idle_for(now).as_secs(), "💤 Entering standby");
                self.close_session();
                self.supervisor.standby();
                self.emit_status();
            }
        }

        self.publish_diagnostics(now);
    }

    fn publish_diagnostics(&mut self, now: Instant) {
        let since_speech = self
            .turns
            .last_speech()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_else(|| self.monitor.idle_for(now));
        let silence = if self.turns.is_speaking() {
            since_speech
        } else {
            Duration::ZERO
        };
        let queue = QueueStats {
            sent_phrases: self.sent_phrases,
            received_phrases: self.received_phrases,
            queue_length: self.queue.len(),
            in_flight: self.queue.in_flight_count(),
            out_queue: self.playout_stats.queue_len,
            buffer_gap: self.playout_stats.buffer_gap,
            efficiency_ratio: efficiency_ratio(self.sent_phrases, self.received_phrases),
            last_sent_duration_ms: self.timer.last_sent_duration_ms(),
            model: self.timer.predictor().model(),
        };
        let server_rx = self
            .last_server_rx
            .map(|t| now.saturating_duration_since(t) < SERVER_RX_FLASH)
            .unwrap_or(false);

        let config = &self.config;
        let turns = &self.turns;
        let status = self.supervisor.status();
        let (frames_processed, network_event, mode) =
            (self.frames_processed, self.network_event, self.mode);
        let busy_remaining = self.timer.busy_remaining(now);
        let rtt = self.timer.latest_rtt().unwrap_or_default();
        let countdown = self.monitor.countdown(now);
        let connecting = self.connecting_buffer.len();

        self.diagnostics.update(|s| {
            s.frames_processed = frames_processed;
            s.sample_rate = CAPTURE_SAMPLE_RATE;
            s.volume_gain = config.volume_gain;
            s.vad_threshold = turns.effective_threshold();
            s.is_speaking = turns.is_speaking();
            s.is_buffering = turns.is_buffering();
            s.buffer_size = turns.buffered_frames();
            s.silence_duration_ms = silence.as_millis() as u64;
            s.silence_tolerance_ms = config.silence_tolerance_ms;
            s.effective_min_duration_ms = config.min_turn_duration_ms;
            s.current_latency = turns.current_latency().map(|d| d.as_secs_f64()).unwrap_or(0.0);
            s.active_mode = mode.to_string();
            s.phase = format!("{:?}", turns.phase());
            s.buffer_gap = queue.buffer_gap;
            s.busy_remaining_ms = busy_remaining.as_millis() as u64;
            s.queue_length = queue.queue_length;
            s.in_flight_count = queue.in_flight;
            s.connecting_buffer_size = connecting;
            s.auto_sleep_countdown = countdown.as_secs();
            s.time_since_last_speech_ms = since_speech.as_millis() as u64;
            s.rtt_ms = rtt.as_millis() as u64;
            s.network_event = network_event;
            s.server_rx = server_rx;
            s.ws_state = status.ws_state().to_string();
            s.queue = queue;
        });
        self.diagnostics.publish();
    }

    // ── transcripts and events ────────────────────────────────────

    fn append_transcript(&mut self, text: &str) {
        let item = match self.transcript.as_mut() {
            Some(item) => {
                item.text.push_str(text);
                item.clone()
            }
            None => {
                self.transcript_seq += 1;
                let item = TranscriptItem {
                    id: self.transcript_seq,
                    group_id: self.phrase_counter,
                    text: text.to_string(),
                    timestamp: Utc::now(),
                    is_final: false,
                };
                self.transcript = Some(item.clone());
                item
            }
        };
        self.emit(EngineEvent::Transcript(item));
    }

    fn close_transcript(&mut self) {
        if let Some(mut item) = self.transcript.take() {
            item.is_final = true;
            self.emit(EngineEvent::Transcript(item));
        }
    }

    fn emit_status(&mut self) {
        let status = self.supervisor.status();
        if status == self.last_status {
            return;
        }
        self.last_status = status;
        self.diagnostics.update(|s| s.ws_state = status.ws_state().to_string());
        self.emit(EngineEvent::StatusChanged(status));
    }

    fn notify(&self, message: &str) {
        info!("{}", message);
        self.emit(EngineEvent::Notification(message.to_string()));
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Engine event receiver dropped");
        }
    }

    fn schedule(&self, delay: Duration, step: Scheduled) {
        let tx = self.scheduled_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(step);
        });
    }

    pub fn status(&self) -> SessionStatus {
        self.supervisor.status()
    }

    pub fn mode(&self) -> ActiveMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;
    use crate::vad::ProbeCommand;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    struct RefusingTransport;

    #[async_trait::async_trait]
    impl SessionTransport for RefusingTransport {
        async fn connect(
            &self,
            _request: ConnectRequest,
            _attempt: AttemptId,
            _events: mpsc::UnboundedSender<TransportEvent>,
        ) -> VoiceResult<Box<dyn SessionHandle>> {
            Err(VoiceError::Transport("offline".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSession {
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl SessionHandle for RecordingSession {
        fn send_audio(&self, chunk: &str) -> VoiceResult<()> {
            self.sent.lock().unwrap().push(chunk.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        engine: LiveEngine<RefusingTransport>,
        channels: EngineChannels,
        _probe_rx: std::sync::mpsc::Receiver<ProbeCommand>,
        _playout_rx: std::sync::mpsc::Receiver<crate::playout::PlayoutCommand>,
        clock: Instant,
    }

    fn fixture(mode: ActiveMode) -> Fixture {
        let config = LiveConfig {
            mode,
            api_key: Some("test-api-key-0123456789".to_string()),
            ..LiveConfig::default()
        };
        let (probe, probe_rx) = ProbeSender::channel();
        let (playout, playout_rx) = PlayoutHandle::channel();
        let (engine, channels) = LiveEngine::new(config, Arc::new(RefusingTransport), probe, playout);
        Fixture {
            engine,
            channels,
            _probe_rx: probe_rx,
            _playout_rx: playout_rx,
            clock: now(),
        }
    }

    impl Fixture {
        /// Pretend a session opened on a fresh attempt
        fn connect(&mut self) -> RecordingSession {
            let session = RecordingSession::default();
            let attempt = self.engine.supervisor.begin_attempt();
            assert!(self.engine.supervisor.on_opened(attempt));
            self.engine.session = Some(Box::new(session.clone()));
            session
        }

        fn frame(&mut self, probability: f32) {
            let frame = AnalyzedFrame {
                samples: vec![0.1; FRAME_SAMPLES],
                rms: 0.1,
                probability,
                captured_at: self.clock,
            };
            self.clock += Duration::from_millis(32);
            self.engine.on_analyzed_frame(frame);
        }

        fn utterance(&mut self) {
            for _ in 0..10 {
                self.frame(0.95);
            }
            for _ in 0..20 {
                self.frame(0.0);
            }
        }
    }

    #[tokio::test]
    async fn test_frames_ignored_when_off() {
        let mut f = fixture(ActiveMode::Off);
        f.utterance();
        assert!(!f.engine.turns.is_speaking());
        assert_eq!(f.engine.queue.len(), 0);
        assert_eq!(f.engine.frames_processed, 30);
    }

    #[tokio::test]
    async fn test_turn_finalized_during_playback_waits_for_burst() {
        let mut f = fixture(ActiveMode::Translate);
        let session = f.connect();

        f.engine.on_playback_event(PlaybackEvent::Started { group_id: 1 });
        f.utterance();
        assert_eq!(f.engine.queue.len(), 1);
        assert_eq!(f.engine.queue.in_flight_count(), 0);
        assert!(session.sent.lock().unwrap().is_empty());

        f.engine.on_playback_event(PlaybackEvent::Idle);
        assert_eq!(session.sent.lock().unwrap().len(), 1);
        assert_eq!(f.engine.queue.len(), 0);
        assert_eq!(f.engine.queue.in_flight_count(), 1);
        assert_eq!(f.engine.sent_phrases, 1);
        assert_eq!(f.engine.network_event, NetworkEvent::Flush);
    }

    #[tokio::test]
    async fn test_superseded_connect_outcome_is_closed() {
        let mut f = fixture(ActiveMode::Translate);
        let _current = f.connect();
        let late = RecordingSession::default();

        f.engine.on_connect_outcome(ConnectOutcome {
            attempt: AttemptId(99),
            result: Ok(Box::new(late.clone())),
        });
        assert!(late.closed.load(Ordering::SeqCst));
        assert_eq!(f.engine.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_audio_dropped_when_nothing_is_connecting() {
        let mut f = fixture(ActiveMode::Translate);
        f.frame(0.0);
        assert!(f.engine.connecting_buffer.is_empty());
        assert_eq!(f.engine.network_event, NetworkEvent::Idle);
    }

    #[tokio::test]
    async fn test_failed_retry_drops_audio_held_for_it() {
        let mut f = fixture(ActiveMode::Translate);
        f.connect();
        let first = f.engine.supervisor.current_attempt().expect("connected attempt");

        f.engine.on_transport_event(TransportEvent::new(
            first,
            SessionEvent::Error("Service unavailable".to_string()),
        ));
        assert_eq!(f.engine.status(), SessionStatus::Connecting);
        for _ in 0..5 {
            f.frame(0.0);
        }
        assert_eq!(f.engine.connecting_buffer.len(), 5);

        // Retry budget is spent, so this failure is final
        let retry = f.engine.supervisor.begin_attempt();
        f.engine.on_connect_outcome(ConnectOutcome {
            attempt: retry,
            result: Err(VoiceError::Transport("connection refused".to_string())),
        });
        assert_eq!(f.engine.status(), SessionStatus::Disconnected);
        assert!(f.engine.connecting_buffer.is_empty());

        let session = f.connect();
        f.frame(0.0);
        assert_eq!(session.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wake_handshake_starts_with_empty_buffer() {
        let mut f = fixture(ActiveMode::Translate);
        f.engine.connecting_buffer.push("stale".to_string());
        f.engine.supervisor.standby();

        f.frame(0.95);
        assert!(f.engine.monitor.handshake().is_in_flight());
        assert_eq!(f.engine.connecting_buffer.len(), 1);
        assert_ne!(f.engine.connecting_buffer[0], "stale");
    }

    #[tokio::test]
    async fn test_manual_flush_clears_stranded_turns() {
        let mut f = fixture(ActiveMode::Translate);
        f.utterance();
        assert_eq!(f.engine.queue.len(), 1);

        f.engine.on_control(ControlCommand::FlushQueue);
        assert!(!f.engine.queue.is_pending_work());
    }

    #[tokio::test]
    async fn test_control_rejected_after_engine_dropped() {
        let f = fixture(ActiveMode::Translate);
        let control = f.channels.control.clone();
        assert_ok!(control.set_volume_gain(2.0));
        drop(f);
        assert_err!(control.set_mode(ActiveMode::Off));
    }
}
