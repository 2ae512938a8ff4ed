//! Tolk interpreter daemon
//!
//! Runs the live engine against the default microphone and speaker:
//! capture → VAD worker → engine → Gemini Live → playout. `tolk-daemon devices`
//! lists audio devices and exits.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tolk_voice::audio::{list_input_devices, list_output_devices};
use tolk_voice::vad::SpeechClassifier;
use tolk_voice::{
    spawn_playout, CaptureConfig, EngineEvent, GeminiLiveTransport, LiveConfig, LiveEngine,
    MicrophoneCapture, ProbeWorker, WebRtcClassifier,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// WebRTC aggressiveness, 0-3
const VAD_MODE: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[tolk-daemon] .env not loaded: {} (using system environment)", e);
    }

    let config = LiveConfig::load().context("load LiveConfig")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().nth(1).as_deref() == Some("devices") {
        println!("Input devices:");
        for name in list_input_devices()? {
            println!("  {}", name);
        }
        println!("Output devices:");
        for name in list_output_devices()? {
            println!("  {}", name);
        }
        return Ok(());
    }

    tracing::info!(mode = %config.mode, model = %config.model, "Tolk daemon starting");

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let probe = ProbeWorker::spawn(
        || Ok(Box::new(WebRtcClassifier::new(VAD_MODE)?) as Box<dyn SpeechClassifier>),
        config.volume_gain,
        frame_tx,
    )
    .context("spawn VAD worker")?;

    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let playout = spawn_playout(config.output_device_name().map(str::to_string), playback_tx)
        .context("spawn playout")?;

    let capture = MicrophoneCapture::new(CaptureConfig {
        device: config.input_device_name().map(str::to_string),
        ..CaptureConfig::default()
    })
    .context("open microphone")?;
    let sender = probe.sender();
    // Stream must stay alive for capture to continue
    let _stream = capture
        .start(move |frame| {
            if let Err(e) = sender.analyze(frame) {
                tracing::debug!("Dropping frame: {}", e);
            }
        })
        .context("start microphone")?;

    let transport = Arc::new(GeminiLiveTransport::new());
    let (engine, channels) = LiveEngine::new(config, transport, probe.sender(), playout);
    let mut events = channels.events;
    let control = channels.control;
    let mut engine_task = tokio::spawn(engine.run(frame_rx, playback_rx));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::StatusChanged(status)) => tracing::info!(%status, "Session status"),
                Some(EngineEvent::Notification(message)) => tracing::info!("{}", message),
                Some(EngineEvent::Error(message)) => tracing::error!("{}", message),
                Some(EngineEvent::Transcript(item)) if item.is_final => {
                    tracing::info!(group = item.group_id, "📝 {}", item.text);
                }
                Some(EngineEvent::Transcript(_)) => {}
                None => break,
            },
            result = &mut engine_task => {
                result.context("engine task panicked")??;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    control.shutdown().ok();
    engine_task.await.context("engine task panicked")??;
    Ok(())
}
