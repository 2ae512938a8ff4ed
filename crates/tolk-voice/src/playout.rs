//! Jitter-buffered playout of the remote voice
//!
//! [`PlayoutScheduler`] is the clock-driven core: it keeps roughly a quarter
//! second of audio queued ahead of the playhead, nudges the playback rate
//! between 0.95x and 1.05x to hold that depth, and reports when playback starts
//! and goes idle. The driver thread feeds it decoded chunks, ticks it every
//! few milliseconds, and hands scheduled chunks to the speaker (rodio).

use crate::audio::{decode_pcm16, PLAYBACK_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Jitter buffer depth the rate control aims for (seconds)
pub const TARGET_BUFFER_SEC: f64 = 0.25;
pub const MAX_PLAYBACK_RATE: f32 = 1.05;
pub const MIN_PLAYBACK_RATE: f32 = 0.95;

/// Dead band around the target before the rate moves
const RATE_DEADBAND_SEC: f64 = 0.1;
/// Below this depth the queue is treated as starved, not short
const STARVED_SEC: f64 = 0.05;
/// Fraction of the remaining rate error closed per tick
const RATE_SMOOTHING: f32 = 0.1;
/// A chunk is handed to the output this close to its start time
const SCHEDULE_AHEAD_SEC: f64 = 0.05;
/// Lag behind real time after which scheduling restarts from now
const MAX_DRIFT_SEC: f64 = 0.5;

/// How often the driver ticks the scheduler
const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// How often the driver publishes stats
const STATS_INTERVAL: Duration = Duration::from_millis(200);

/// One decoded chunk waiting for, or scheduled for, playback
#[derive(Debug, Clone)]
pub struct AudioQueueItem {
    pub id: u64,
    pub samples: Vec<f32>,
    /// Response turn this chunk belongs to
    pub group_id: u64,
    /// Duration at 1.0x, seconds
    pub duration: f64,
    /// Start time on the scheduler clock, 0 until scheduled
    pub scheduled_time: f64,
}

/// A chunk the scheduler released to the output on this tick
#[derive(Debug, Clone)]
pub struct ScheduledChunk {
    pub item: AudioQueueItem,
    pub rate: f32,
    pub end_time: f64,
}

/// Play-state signal and periodic stats from the playout side
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Playback started, or moved on to a new response group
    Started { group_id: u64 },
    /// Last scheduled chunk ended and nothing is queued
    Idle,
    Stats(PlayoutStats),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlayoutStats {
    pub queue_len: usize,
    /// Queued depth minus target, seconds
    pub buffer_gap: f64,
    pub playback_rate: f32,
    pub dropped_chunks: u64,
}

/// Outcome of one scheduler tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub scheduled: Option<ScheduledChunk>,
    pub state_change: Option<PlaybackEvent>,
}

#[derive(Debug, Clone, Copy)]
struct NowPlaying {
    group_id: u64,
    end_time: f64,
}

/// Rate the controller steers toward for a given queued depth
pub fn target_rate(queued_sec: f64) -> f32 {
    if queued_sec > TARGET_BUFFER_SEC + RATE_DEADBAND_SEC {
        MAX_PLAYBACK_RATE.min((1.0 + (queued_sec - TARGET_BUFFER_SEC)) as f32)
    } else if queued_sec < TARGET_BUFFER_SEC - RATE_DEADBAND_SEC && queued_sec > STARVED_SEC {
        MIN_PLAYBACK_RATE.max((1.0 - (TARGET_BUFFER_SEC - queued_sec)) as f32)
    } else {
        1.0
    }
}

/// Clock-driven jitter buffer
#[derive(Debug)]
pub struct PlayoutScheduler {
    sample_rate: u32,
    queue: VecDeque<AudioQueueItem>,
    next_play_time: f64,
    now_playing: Option<NowPlaying>,
    playing: bool,
    rate: f32,
    queued_depth: f64,
    next_id: u64,
    dropped_chunks: u64,
}

impl PlayoutScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            queue: VecDeque::new(),
            next_play_time: 0.0,
            now_playing: None,
            playing: false,
            rate: 1.0,
            queued_depth: 0.0,
            next_id: 0,
            dropped_chunks: 0,
        }
    }

    /// Decode a PCM16 chunk and queue it. Undecodable chunks are logged and dropped.
    pub fn enqueue_chunk(&mut self, pcm: &[u8], group_id: u64) -> bool {
        match decode_pcm16(pcm) {
            Ok(samples) => {
                self.enqueue_samples(samples, group_id);
                true
            }
            Err(e) => {
                self.dropped_chunks += 1;
                warn!(group_id, dropped = self.dropped_chunks, "Dropping audio chunk: {}", e);
                false
            }
        }
    }

    pub fn enqueue_samples(&mut self, samples: Vec<f32>, group_id: u64) {
        self.next_id += 1;
        let duration = samples.len() as f64 / self.sample_rate as f64;
        self.queue.push_back(AudioQueueItem {
            id: self.next_id,
            samples,
            group_id,
            duration,
            scheduled_time: 0.0,
        });
    }

    /// Advance the scheduler to `now` (seconds on the output clock)
    pub fn tick(&mut self, now: f64) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if let Some(current) = self.now_playing {
            if now > current.end_time {
                self.now_playing = None;
                if self.queue.is_empty() && self.playing {
                    self.playing = false;
                    outcome.state_change = Some(PlaybackEvent::Idle);
                }
            }
        }

        let depth = (self.next_play_time - now).max(0.0);
        self.queued_depth = depth;
        let target = target_rate(depth);
        self.rate += (target - self.rate) * RATE_SMOOTHING;

        if self.queue.is_empty() {
            return outcome;
        }

        let mut play_at = now.max(self.next_play_time);
        if now - self.next_play_time > MAX_DRIFT_SEC {
            play_at = now;
        }
        if play_at - now >= SCHEDULE_AHEAD_SEC {
            return outcome;
        }

        let Some(mut item) = self.queue.pop_front() else {
            return outcome;
        };
        let duration = item.duration / self.rate as f64;
        item.scheduled_time = play_at;
        self.next_play_time = play_at + duration;

        let previous_group = self.now_playing.map(|p| p.group_id);
        self.now_playing = Some(NowPlaying {
            group_id: item.group_id,
            end_time: self.next_play_time,
        });
        if !self.playing || previous_group != Some(item.group_id) {
            self.playing = true;
            outcome.state_change = Some(PlaybackEvent::Started {
                group_id: item.group_id,
            });
        }

        outcome.scheduled = Some(ScheduledChunk {
            rate: self.rate,
            end_time: self.next_play_time,
            item,
        });
        outcome
    }

    /// Forget everything queued or playing
    pub fn reset(&mut self) {
        self.queue.clear();
        self.next_play_time = 0.0;
        self.now_playing = None;
        self.playing = false;
        self.rate = 1.0;
        self.queued_depth = 0.0;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn active_group(&self) -> Option<u64> {
        self.now_playing.map(|p| p.group_id)
    }

    pub fn playback_rate(&self) -> f32 {
        self.rate
    }

    pub fn stats(&self) -> PlayoutStats {
        PlayoutStats {
            queue_len: self.queue.len(),
            buffer_gap: self.queued_depth - TARGET_BUFFER_SEC,
            playback_rate: self.rate,
            dropped_chunks: self.dropped_chunks,
        }
    }
}

/// Speaker backend the driver plays scheduled chunks on
pub trait AudioOutput {
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32, rate: f32) -> VoiceResult<()>;

    /// Silence whatever is queued on the device
    fn stop(&mut self);
}

/// Rodio output on a named or default device
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
}

impl RodioOutput {
    /// Open `device` by name, falling back to the default output with a warning
    pub fn open(device: Option<&str>) -> VoiceResult<Self> {
        if let Some(name) = device {
            match Self::open_named(name) {
                Ok(output) => {
                    info!("🔊 Output device set to: {}", name);
                    return Ok(output);
                }
                Err(e) => warn!("Failed to set output device '{}', using default: {}", name, e),
            }
        }

        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        Self::with_stream(stream, handle)
    }

    fn open_named(name: &str) -> VoiceResult<Self> {
        let host = rodio::cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::AudioDevice(format!("Output device '{}' not found", name)))?;
        let (stream, handle) = OutputStream::try_from_device(&device)
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        Self::with_stream(stream, handle)
    }

    fn with_stream(stream: OutputStream, handle: OutputStreamHandle) -> VoiceResult<Self> {
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            handle,
            sink,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32, rate: f32) -> VoiceResult<()> {
        let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples).speed(rate);
        self.sink.append(source);
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.stop();
        match Sink::try_new(&self.handle) {
            Ok(sink) => self.sink = sink,
            Err(e) => warn!("Failed to recreate output sink: {}", e),
        }
    }
}

/// Commands accepted by the playout driver
#[derive(Debug)]
pub enum PlayoutCommand {
    Enqueue { pcm: Vec<u8>, group_id: u64 },
    Reset,
    SetOutputDevice(Option<String>),
    Shutdown,
}

/// Sending side of the playout driver
#[derive(Debug, Clone)]
pub struct PlayoutHandle {
    tx: std_mpsc::Sender<PlayoutCommand>,
}

impl PlayoutHandle {
    /// Handle plus the raw command receiver, for driving a custom loop
    pub fn channel() -> (Self, std_mpsc::Receiver<PlayoutCommand>) {
        let (tx, rx) = std_mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, command: PlayoutCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn enqueue(&self, pcm: Vec<u8>, group_id: u64) -> VoiceResult<()> {
        self.send(PlayoutCommand::Enqueue { pcm, group_id })
    }

    pub fn reset(&self) -> VoiceResult<()> {
        self.send(PlayoutCommand::Reset)
    }

    pub fn set_output_device(&self, device: Option<String>) -> VoiceResult<()> {
        self.send(PlayoutCommand::SetOutputDevice(device))
    }
}

/// Spawn the playout thread on the speaker; device failures are logged, not fatal
pub fn spawn_playout(
    output_device: Option<String>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) -> VoiceResult<PlayoutHandle> {
    let (handle, rx) = PlayoutHandle::channel();
    thread::Builder::new()
        .name("tolk-playout".to_string())
        .spawn(move || {
            run_playout(rx, events, output_device, |device| RodioOutput::open(device));
        })?;
    Ok(handle)
}

/// Playout loop: apply commands, tick the scheduler, forward chunks to the output.
///
/// Output streams are often `!Send`, so the output is opened on this thread
/// through `open_output`, and reopened when the device selection changes.
pub fn run_playout<O, F>(
    rx: std_mpsc::Receiver<PlayoutCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    output_device: Option<String>,
    mut open_output: F,
) where
    O: AudioOutput,
    F: FnMut(Option<&str>) -> VoiceResult<O>,
{
    let mut scheduler = PlayoutScheduler::new(PLAYBACK_SAMPLE_RATE);
    let mut device = output_device;
    let mut output = open_or_log(&mut open_output, device.as_deref());
    let origin = Instant::now();
    let mut last_stats = Instant::now();

    info!("🔊 Playout driver started ({}Hz)", PLAYBACK_SAMPLE_RATE);

    loop {
        match rx.recv_timeout(TICK_INTERVAL) {
            Ok(PlayoutCommand::Enqueue { pcm, group_id }) => {
                scheduler.enqueue_chunk(&pcm, group_id);
            }
            Ok(PlayoutCommand::Reset) => {
                scheduler.reset();
                if let Some(out) = output.as_mut() {
                    out.stop();
                }
                debug!("Playout reset");
            }
            Ok(PlayoutCommand::SetOutputDevice(next)) => {
                if next != device {
                    device = next;
                    output = open_or_log(&mut open_output, device.as_deref());
                }
            }
            Ok(PlayoutCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        let outcome = scheduler.tick(origin.elapsed().as_secs_f64());
        if let Some(chunk) = outcome.scheduled {
            if let Some(out) = output.as_mut() {
                if let Err(e) = out.play(chunk.item.samples, PLAYBACK_SAMPLE_RATE, chunk.rate) {
                    warn!("Playback failed for chunk {}: {}", chunk.item.id, e);
                }
            }
        }
        if let Some(change) = outcome.state_change {
            if events.send(change).is_err() {
                break;
            }
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            if events.send(PlaybackEvent::Stats(scheduler.stats())).is_err() {
                break;
            }
        }
    }

    info!("🛑 Playout driver ended");
}

fn open_or_log<O, F>(open_output: &mut F, device: Option<&str>) -> Option<O>
where
    F: FnMut(Option<&str>) -> VoiceResult<O>,
{
    match open_output(device) {
        Ok(output) => Some(output),
        Err(e) => {
            error!("No audio output available: {}", e);
            None
        }
    }
}
