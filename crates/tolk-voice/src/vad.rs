//! Voice activity probing
//!
//! [`VoiceActivityProbe`] wraps a black-box [`SpeechClassifier`] and turns each
//! captured frame into a speech probability. When the classifier cannot be built,
//! or fails once during inference, the probe degrades to an energy heuristic for
//! the rest of the session.
//!
//! [`ProbeWorker`] runs the probe on its own thread so inference never blocks
//! frame delivery; frames come back as [`AnalyzedFrame`]s in capture order.

use crate::audio::{apply_gain, rms, AudioFrame, FRAME_SAMPLES};
use crate::error::{VoiceError, VoiceResult};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Below this RMS the state machine does not ask the probe at all.
pub const ENERGY_FLOOR_RMS: f32 = 0.002;

/// Below this RMS the probe skips inference and answers with the heuristic.
pub const PREFILTER_RMS: f32 = 0.02;

/// Heuristic: frames louder than this count as speech.
pub const HEURISTIC_FLOOR_RMS: f32 = 0.01;

/// Probability the heuristic reports for a loud frame.
pub const HEURISTIC_PROBABILITY: f32 = 0.8;

/// Black-box speech classifier: one fixed-size window in, probability out.
///
/// Implementations may carry recurrent state between calls; `reset` clears it.
pub trait SpeechClassifier {
    /// Window length the classifier expects
    fn window_size(&self) -> usize {
        FRAME_SAMPLES
    }

    fn infer(&mut self, window: &[f32]) -> VoiceResult<f32>;

    fn reset(&mut self) -> VoiceResult<()>;
}

/// Energy heuristic used whenever the classifier is skipped or unavailable
pub fn heuristic_probability(energy: f32) -> f32 {
    if energy > HEURISTIC_FLOOR_RMS {
        HEURISTIC_PROBABILITY
    } else {
        0.0
    }
}

/// WebRTC VAD behind the classifier interface.
///
/// WebRTC only accepts 10/20/30 ms frames, so each 512-sample window is
/// classified on its first 480 samples (30 ms at 16 kHz).
pub struct WebRtcClassifier {
    vad: Vad,
    mode: u8,
}

impl WebRtcClassifier {
    const SLICE: usize = 480;

    /// Create a classifier for 16 kHz audio. `mode` is 0-3, 3 being most aggressive.
    pub fn new(mode: u8) -> VoiceResult<Self> {
        if mode > 3 {
            return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", mode)));
        }
        info!("🎙️ Initializing WebRTC VAD (16000Hz, mode: {})", mode);
        Ok(Self {
            vad: build_vad(mode),
            mode,
        })
    }
}

fn build_vad(mode: u8) -> Vad {
    let vad_mode = match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };
    let mut vad = Vad::new();
    vad.set_mode(vad_mode);
    vad.set_sample_rate(SampleRate::Rate16kHz);
    vad
}

impl SpeechClassifier for WebRtcClassifier {
    fn infer(&mut self, window: &[f32]) -> VoiceResult<f32> {
        if window.len() < Self::SLICE {
            return Err(VoiceError::VadInference(format!(
                "Expected at least {} samples, got {}",
                Self::SLICE,
                window.len()
            )));
        }

        let pcm: Vec<i16> = window[..Self::SLICE]
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        let is_speech = self
            .vad
            .is_voice_segment(&pcm)
            .map_err(|e| VoiceError::VadInference(format!("VAD processing failed: {:?}", e)))?;

        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    fn reset(&mut self) -> VoiceResult<()> {
        // WebRTC VAD has no explicit reset, recreate it
        self.vad = build_vad(self.mode);
        Ok(())
    }
}

/// Frame-level speech probability with permanent heuristic fallback
pub struct VoiceActivityProbe {
    classifier: Option<Box<dyn SpeechClassifier>>,
    degraded_logged: bool,
}

impl VoiceActivityProbe {
    pub fn new(classifier: Box<dyn SpeechClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
            degraded_logged: false,
        }
    }

    /// Probe that never runs inference (classifier failed to initialize)
    pub fn heuristic_only() -> Self {
        Self {
            classifier: None,
            degraded_logged: true,
        }
    }

    /// Whether the probe has fallen back to the energy heuristic
    pub fn is_degraded(&self) -> bool {
        self.classifier.is_none()
    }

    /// Speech probability for one frame, in [0, 1]
    pub fn probe(&mut self, frame: &[f32]) -> f32 {
        let energy = rms(frame);

        let Some(classifier) = self.classifier.as_mut() else {
            return heuristic_probability(energy);
        };
        if energy < PREFILTER_RMS {
            return heuristic_probability(energy);
        }

        match classify_windows(classifier.as_mut(), frame) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                if !self.degraded_logged {
                    warn!("⚠️ VAD inference failed, using energy heuristic for this session: {}", e);
                    self.degraded_logged = true;
                }
                self.classifier = None;
                heuristic_probability(energy)
            }
        }
    }

    /// Clear recurrent state before a new capture session
    pub fn reset(&mut self) {
        if let Some(classifier) = self.classifier.as_mut() {
            if let Err(e) = classifier.reset() {
                warn!("⚠️ VAD reset failed, using energy heuristic: {}", e);
                self.classifier = None;
                self.degraded_logged = true;
            }
        }
    }
}

/// Classify a frame window by window; the frame scores its loudest window.
fn classify_windows(classifier: &mut dyn SpeechClassifier, frame: &[f32]) -> VoiceResult<f32> {
    let size = classifier.window_size();
    let mut best = 0.0f32;
    let mut window = vec![0.0f32; size];

    for chunk in frame.chunks(size) {
        let p = if chunk.len() == size {
            classifier.infer(chunk)?
        } else {
            window[..chunk.len()].copy_from_slice(chunk);
            window[chunk.len()..].fill(0.0);
            classifier.infer(&window)?
        };
        best = best.max(p);
    }
    Ok(best)
}

/// A frame after gain, energy measurement and probing
#[derive(Debug, Clone)]
pub struct AnalyzedFrame {
    /// Gain-adjusted samples
    pub samples: Vec<f32>,
    pub rms: f32,
    pub probability: f32,
    pub captured_at: Instant,
}

/// Front half of the turn state machine: gain, RMS, and the energy-gated probe
pub struct FrameAnalyzer {
    gain: f32,
    probe: VoiceActivityProbe,
}

impl FrameAnalyzer {
    pub fn new(probe: VoiceActivityProbe, gain: f32) -> Self {
        Self { gain, probe }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn analyze(&mut self, frame: AudioFrame) -> AnalyzedFrame {
        let AudioFrame { mut samples, captured_at } = frame;
        apply_gain(&mut samples, self.gain);
        let energy = rms(&samples);
        let probability = if energy > ENERGY_FLOOR_RMS {
            self.probe.probe(&samples)
        } else {
            0.0
        };
        AnalyzedFrame {
            samples,
            rms: energy,
            probability,
            captured_at,
        }
    }

    pub fn reset(&mut self) {
        self.probe.reset();
    }
}

/// Commands accepted by the probe worker
#[derive(Debug)]
pub enum ProbeCommand {
    Analyze(AudioFrame),
    SetGain(f32),
    Reset,
}

/// Cloneable handle for feeding the worker, e.g. from the capture callback
#[derive(Debug, Clone)]
pub struct ProbeSender {
    tx: std_mpsc::Sender<ProbeCommand>,
}

impl ProbeSender {
    /// Sender plus the raw command receiver, for hosts running their own analyzer
    pub fn channel() -> (Self, std_mpsc::Receiver<ProbeCommand>) {
        let (tx, rx) = std_mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, command: ProbeCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn analyze(&self, frame: AudioFrame) -> VoiceResult<()> {
        self.send(ProbeCommand::Analyze(frame))
    }
}

/// Dedicated inference thread owning the probe
pub struct ProbeWorker {
    sender: ProbeSender,
    handle: thread::JoinHandle<()>,
}

impl ProbeWorker {
    /// Spawn the worker. The classifier is built inside the thread since
    /// classifier handles are not required to be `Send`.
    pub fn spawn<F>(
        make_classifier: F,
        gain: f32,
        out: mpsc::UnboundedSender<AnalyzedFrame>,
    ) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<Box<dyn SpeechClassifier>> + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel::<ProbeCommand>();

        let handle = thread::Builder::new()
            .name("tolk-vad".to_string())
            .spawn(move || {
                let probe = match make_classifier() {
                    Ok(classifier) => VoiceActivityProbe::new(classifier),
                    Err(e) => {
                        warn!("⚠️ VAD backend unavailable, using energy heuristic: {}", e);
                        VoiceActivityProbe::heuristic_only()
                    }
                };
                let mut analyzer = FrameAnalyzer::new(probe, gain);
                info!("🔄 VAD worker started");

                while let Ok(command) = rx.recv() {
                    match command {
                        ProbeCommand::Analyze(frame) => {
                            if out.send(analyzer.analyze(frame)).is_err() {
                                debug!("VAD worker: engine receiver dropped");
                                break;
                            }
                        }
                        ProbeCommand::SetGain(gain) => analyzer.set_gain(gain),
                        ProbeCommand::Reset => analyzer.reset(),
                    }
                }

                info!("🛑 VAD worker ended");
            })?;

        Ok(Self {
            sender: ProbeSender { tx },
            handle,
        })
    }

    pub fn sender(&self) -> ProbeSender {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Scripted classifier; fails on the call index given in `fail_at`.
    struct Scripted {
        value: f32,
        calls: usize,
        fail_at: Option<usize>,
        resets: usize,
    }

    impl Scripted {
        fn new(value: f32) -> Self {
            Self { value, calls: 0, fail_at: None, resets: 0 }
        }
    }

    impl SpeechClassifier for Scripted {
        fn infer(&mut self, window: &[f32]) -> VoiceResult<f32> {
            assert_eq!(window.len(), FRAME_SAMPLES);
            self.calls += 1;
            if Some(self.calls) == self.fail_at {
                return Err(VoiceError::VadInference("boom".into()));
            }
            Ok(self.value)
        }

        fn reset(&mut self) -> VoiceResult<()> {
            self.resets += 1;
            Ok(())
        }
    }

    #[test]
    fn test_heuristic_probability() {
        assert_eq!(heuristic_probability(0.005), 0.0);
        assert_eq!(heuristic_probability(0.05), HEURISTIC_PROBABILITY);
    }

    #[test]
    fn test_prefilter_skips_inference() {
        let mut probe = VoiceActivityProbe::new(Box::new(Scripted::new(0.3)));
        // RMS 0.015: below the pre-filter, above the heuristic floor
        assert_eq!(probe.probe(&vec![0.015; 512]), HEURISTIC_PROBABILITY);
        // Loud frame goes to the classifier
        assert_eq!(probe.probe(&vec![0.5; 512]), 0.3);
    }

    #[test]
    fn test_inference_error_degrades_permanently() {
        let mut scripted = Scripted::new(0.9);
        scripted.fail_at = Some(1);
        let mut probe = VoiceActivityProbe::new(Box::new(scripted));

        assert_eq!(probe.probe(&vec![0.5; 512]), HEURISTIC_PROBABILITY);
        assert!(probe.is_degraded());
        // Never goes back to the classifier
        assert_eq!(probe.probe(&vec![0.5; 512]), HEURISTIC_PROBABILITY);
        assert_eq!(probe.probe(&vec![0.0; 512]), 0.0);
    }

    #[test]
    fn test_long_frames_are_windowed() {
        let mut probe = VoiceActivityProbe::new(Box::new(Scripted::new(0.7)));
        // 1200 samples -> 3 windows, last one zero padded
        assert_eq!(probe.probe(&vec![0.5; 1200]), 0.7);
    }

    #[test]
    fn test_analyzer_energy_floor_and_gain() {
        let probe = VoiceActivityProbe::new(Box::new(Scripted::new(0.9)));
        let mut analyzer = FrameAnalyzer::new(probe, 2.0);

        let quiet = analyzer.analyze(AudioFrame::new(vec![0.0005; 512]));
        assert_eq!(quiet.probability, 0.0);
        assert!((quiet.rms - 0.001).abs() < 1e-6);

        let loud = analyzer.analyze(AudioFrame::new(vec![0.2; 512]));
        assert!((loud.samples[0] - 0.4).abs() < 1e-6);
        assert_eq!(loud.probability, 0.9);
    }

    #[test]
    fn test_webrtc_silence() {
        let mut classifier = WebRtcClassifier::new(2).unwrap();
        assert_eq!(classifier.infer(&vec![0.0; 512]).unwrap(), 0.0);
        assert!(classifier.reset().is_ok());
        assert!(WebRtcClassifier::new(4).is_err());
    }

    #[tokio::test]
    async fn test_worker_preserves_capture_order() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let worker = ProbeWorker::spawn(
            || Ok(Box::new(Scripted::new(0.5)) as Box<dyn SpeechClassifier>),
            1.0,
            out_tx,
        )
        .unwrap();
        let sender = worker.sender();

        for i in 0..5 {
            sender.analyze(AudioFrame::new(vec![0.1 * (i + 1) as f32; 512])).unwrap();
        }

        for i in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!((frame.samples[0] - 0.1 * (i + 1) as f32).abs() < 1e-6);
        }
        assert!(worker.is_running());
    }

    #[tokio::test]
    async fn test_worker_falls_back_when_backend_fails() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let worker = ProbeWorker::spawn(
            || Err(VoiceError::VadInit("no model".into())),
            1.0,
            out_tx,
        )
        .unwrap();

        worker.sender().analyze(AudioFrame::new(vec![0.3; 512])).unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.probability, HEURISTIC_PROBABILITY);
    }
}
