//! Live engine configuration: defaults, loading, and range validation.
//!
//! Loaded the same way as the rest of the workspace: built-in defaults, an optional
//! TOML file, then `TOLK__*` environment overrides.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Model used for live sessions unless overridden.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Prebuilt voice requested from the remote peer.
pub const DEFAULT_VOICE: &str = "Puck";

/// What the engine does with captured speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveMode {
    Translate,
    Transcribe,
    Off,
}

impl ActiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveMode::Translate => "translate",
            ActiveMode::Transcribe => "transcribe",
            ActiveMode::Off => "off",
        }
    }
}

impl fmt::Display for ActiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActiveMode {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "translate" => Ok(ActiveMode::Translate),
            "transcribe" => Ok(ActiveMode::Transcribe),
            "off" => Ok(ActiveMode::Off),
            other => Err(VoiceError::Config(format!("unknown mode '{}'", other))),
        }
    }
}

/// Settings surface consumed by the engine and exposed to settings UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Speech probability threshold (0.1 - 0.9)
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,

    /// Hangover window before an utterance is declared over (200 - 2000 ms)
    #[serde(default = "default_silence_tolerance_ms")]
    pub silence_tolerance_ms: u64,

    /// Minimum turn duration shown to the user (500 - 8000 ms)
    #[serde(default = "default_min_turn_duration_ms")]
    pub min_turn_duration_ms: u64,

    /// Software gain applied to captured frames (1.0 - 5.0)
    #[serde(default = "default_volume_gain")]
    pub volume_gain: f32,

    /// Requested speaking rate of the remote voice (1.0 - 2.0)
    #[serde(default = "default_ai_speaking_rate")]
    pub ai_speaking_rate: f32,

    #[serde(default)]
    pub input_device: Option<String>,

    #[serde(default)]
    pub output_device: Option<String>,

    /// Replaces the generated system instruction when non-blank
    #[serde(default)]
    pub custom_system_instruction: Option<String>,

    #[serde(default = "default_target_languages")]
    pub target_languages: Vec<String>,

    #[serde(default = "default_voice_name")]
    pub voice_name: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Idle time before the session is put into standby
    #[serde(default = "default_auto_sleep_secs")]
    pub auto_sleep_secs: u64,

    #[serde(default = "default_mode")]
    pub mode: ActiveMode,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub debug: bool,
}

fn default_vad_threshold() -> f32 {
    0.6
}

fn default_silence_tolerance_ms() -> u64 {
    500
}

fn default_min_turn_duration_ms() -> u64 {
    1000
}

fn default_volume_gain() -> f32 {
    1.0
}

fn default_ai_speaking_rate() -> f32 {
    1.0
}

fn default_target_languages() -> Vec<String> {
    vec!["Svenska".to_string()]
}

fn default_voice_name() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_auto_sleep_secs() -> u64 {
    120
}

fn default_mode() -> ActiveMode {
    ActiveMode::Translate
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            vad_threshold: default_vad_threshold(),
            silence_tolerance_ms: default_silence_tolerance_ms(),
            min_turn_duration_ms: default_min_turn_duration_ms(),
            volume_gain: default_volume_gain(),
            ai_speaking_rate: default_ai_speaking_rate(),
            input_device: None,
            output_device: None,
            custom_system_instruction: None,
            target_languages: default_target_languages(),
            voice_name: default_voice_name(),
            model: default_model(),
            api_key: None,
            auto_sleep_secs: default_auto_sleep_secs(),
            mode: default_mode(),
            log_level: default_log_level(),
            debug: false,
        }
    }
}

impl LiveConfig {
    /// Load from `TOLK_CONFIG` (default `config/tolk.toml`, optional) and `TOLK__*` env vars.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("TOLK_CONFIG").unwrap_or_else(|_| "config/tolk.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load using an explicit file path; a missing file is not an error.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = ::config::Config::builder()
            .set_default("vad_threshold", default_vad_threshold() as f64)?
            .set_default("silence_tolerance_ms", default_silence_tolerance_ms())?
            .set_default("min_turn_duration_ms", default_min_turn_duration_ms())?
            .set_default("volume_gain", default_volume_gain() as f64)?
            .set_default("ai_speaking_rate", default_ai_speaking_rate() as f64)?
            .set_default("auto_sleep_secs", default_auto_sleep_secs())?
            .set_default("mode", default_mode().as_str())?
            .set_default("log_level", default_log_level())?;

        let builder = if path.exists() {
            builder.add_source(::config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                ::config::Environment::with_prefix("TOLK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("target_languages")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: LiveConfig = built.try_deserialize()?;
        if cfg.api_key.is_none() {
            cfg.api_key = std::env::var("GEMINI_API_KEY")
                .or_else(|_| std::env::var("API_KEY"))
                .ok();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values outside the ranges the settings surface allows.
    pub fn validate(&self) -> VoiceResult<()> {
        check_range("vad_threshold", self.vad_threshold as f64, 0.1, 0.9)?;
        check_range("silence_tolerance_ms", self.silence_tolerance_ms as f64, 200.0, 2000.0)?;
        check_range("min_turn_duration_ms", self.min_turn_duration_ms as f64, 500.0, 8000.0)?;
        check_range("volume_gain", self.volume_gain as f64, 1.0, 5.0)?;
        check_range("ai_speaking_rate", self.ai_speaking_rate as f64, 1.0, 2.0)?;

        if self.auto_sleep_secs < 10 {
            return Err(VoiceError::Config(format!(
                "auto_sleep_secs must be at least 10, got {}",
                self.auto_sleep_secs
            )));
        }
        if self.target_languages.iter().all(|l| l.trim().is_empty()) {
            return Err(VoiceError::Config(
                "target_languages must name at least one language".to_string(),
            ));
        }
        Ok(())
    }

    /// Device name to open, with "default" treated as the system default.
    pub fn input_device_name(&self) -> Option<&str> {
        device_name(self.input_device.as_deref())
    }

    pub fn output_device_name(&self) -> Option<&str> {
        device_name(self.output_device.as_deref())
    }

    /// Tracing filter directive derived from `log_level` and `debug`.
    pub fn log_filter(&self) -> String {
        if self.debug {
            format!("{},tolk_voice=debug", self.log_level)
        } else {
            self.log_level.clone()
        }
    }
}

fn device_name(name: Option<&str>) -> Option<&str> {
    match name.map(str::trim) {
        None | Some("") | Some("default") => None,
        Some(n) => Some(n),
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> VoiceResult<()> {
    if !(min..=max).contains(&value) {
        return Err(VoiceError::Config(format!(
            "{} must be within {}..={}, got {}",
            field, min, max, value
        )));
    }
    Ok(())
}
