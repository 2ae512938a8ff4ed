//! Microphone capture (CPAL) and the PCM16 wire codec
//!
//! Capture produces fixed-size mono frames at 16 kHz; the codec turns frames
//! into the base64 little-endian PCM16 chunks the live API speaks, and back.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::time::Instant;
use tracing::{info, warn};

/// Outbound sample rate expected by the live API.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Inbound sample rate of the remote voice.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame (32 ms at 16 kHz), one classifier window.
pub const FRAME_SAMPLES: usize = 512;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Frame size in samples (default: 512)
    pub frame_size: usize,

    /// Named input device; `None` opens the system default
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_size: FRAME_SAMPLES,
            device: None,
        }
    }
}

/// One fixed-size block of captured audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }

    /// Frame duration at the given sample rate
    pub fn duration_ms(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 * 1000.0 / sample_rate as f64
    }
}

/// Apply software gain in place
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Root-mean-square energy of a block of samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// f32 samples to 16-bit little-endian PCM bytes
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = (if s < 0.0 { s * 32768.0 } else { s * 32767.0 }) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// 16-bit little-endian PCM bytes to f32 samples
pub fn decode_pcm16(bytes: &[u8]) -> VoiceResult<Vec<f32>> {
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio chunk".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 chunk has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Frame samples to the base64 payload sent on the wire
pub fn encode_chunk_base64(samples: &[f32]) -> String {
    BASE64.encode(encode_pcm16(samples))
}

/// Base64 payload from the wire to raw PCM bytes
pub fn decode_chunk_base64(data: &str) -> VoiceResult<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| VoiceError::Decode(format!("invalid base64 audio: {}", e)))
}

/// Microphone capture using CPAL
pub struct MicrophoneCapture {
    config: CaptureConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl MicrophoneCapture {
    /// Open the configured input device
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        info!("🎤 Initializing microphone capture ({}Hz, {} samples/frame)",
              config.sample_rate, config.frame_size);

        let host = cpal::default_host();
        let device = match config.device.as_deref() {
            Some(name) => find_input_device(&host, name)?,
            None => host.default_input_device()
                .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?,
        };

        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        // Surfaces permission problems before we try to build a stream
        let default_config = device.default_input_config()?;
        info!("🔧 Default config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing; every full frame is handed to `on_frame` in capture order.
    ///
    /// The returned stream must be kept alive for capture to continue.
    pub fn start<F>(self, mut on_frame: F) -> VoiceResult<Stream>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        info!("▶️ Starting microphone stream");

        let frame_size = self.config.frame_size;
        let mut pending = Vec::with_capacity(frame_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= frame_size {
                        let samples = std::mem::replace(&mut pending, Vec::with_capacity(frame_size));
                        on_frame(AudioFrame::new(samples));
                    }
                }
            },
            move |err| {
                warn!("Microphone stream error: {}", err);
            },
            None,
        )?;

        stream.play()?;

        info!("✅ Microphone capture started");

        Ok(stream)
    }
}

fn find_input_device(host: &cpal::Host, name: &str) -> VoiceResult<Device> {
    for device in host.input_devices()? {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(VoiceError::AudioDevice(format!("Input device '{}' not found", name)))
}

/// List available input devices
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.input_devices()?.filter_map(|d| d.name().ok()).collect())
}

/// List available output devices
pub fn list_output_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.output_devices()?.filter_map(|d| d.name().ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_size, 512);
        assert!(config.device.is_none());
    }

    #[test]
    fn test_pcm16_scaling_is_asymmetric() {
        let bytes = encode_pcm16(&[1.0, -1.0, 0.0, 2.0, -3.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![32767, -32768, 0, 32767, -32768]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert!(decode_pcm16(&[0x01, 0x02, 0x03]).is_err());
        assert!(decode_pcm16(&[]).is_err());
        let samples = decode_pcm16(&[0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![-1.0]);
    }

    #[test]
    fn test_base64_payload() {
        assert_eq!(encode_chunk_base64(&[0.0, 0.0]), "AAAAAA==");
        assert!(decode_chunk_base64("not base64!").is_err());
    }

    #[test]
    fn test_rms_and_gain() {
        let mut samples = vec![0.1f32; 512];
        assert!((rms(&samples) - 0.1).abs() < 1e-6);
        apply_gain(&mut samples, 3.0);
        assert!((rms(&samples) - 0.3).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_device_listings_only_hold_named_devices() {
        // Headless hosts may fail to enumerate; unnamed devices are skipped either way
        for names in [list_input_devices(), list_output_devices()].into_iter().flatten() {
            assert!(names.iter().all(|name| !name.is_empty()));
        }
    }
}
