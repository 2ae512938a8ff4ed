//! Error types for the Tolk voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the turn-taking engine and its collaborators
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone access denied: {0}")]
    DevicePermission(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD inference error: {0}")]
    VadInference(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl VoiceError {
    /// Whether this error ends progress for the current activation.
    ///
    /// Only these reach the top-level error surface; everything else is
    /// absorbed by the component that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Auth(_)
                | VoiceError::DevicePermission(_)
                | VoiceError::AudioDevice(_)
                | VoiceError::Config(_)
        )
    }
}

/// How the engine should react to an error message reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Server unavailable or internal error: retry once after a backoff
    Transient,
    /// Known noise from the remote API, dropped without state change
    Ignored,
    /// Anything else: surface it, no automatic retry
    Fatal,
}

impl ErrorClass {
    /// Classify a transport error message by its signature
    pub fn of(message: &str) -> Self {
        if message.contains("Operation is not implemented") {
            ErrorClass::Ignored
        } else if message.contains("unavailable")
            || message.contains("503")
            || message.contains("Internal error")
        {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DevicePermission(err.to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<::config::ConfigError> for VoiceError {
    fn from(err: ::config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(ErrorClass::of("Service unavailable"), ErrorClass::Transient);
        assert_eq!(ErrorClass::of("HTTP 503 from upstream"), ErrorClass::Transient);
        assert_eq!(ErrorClass::of("Internal error encountered."), ErrorClass::Transient);
        assert_eq!(ErrorClass::of("Operation is not implemented, or supported"), ErrorClass::Ignored);
        assert_eq!(ErrorClass::of("API key not valid"), ErrorClass::Fatal);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(VoiceError::Auth("missing key".into()).is_fatal());
        assert!(VoiceError::DevicePermission("denied".into()).is_fatal());
        assert!(!VoiceError::Decode("odd length".into()).is_fatal());
        assert!(!VoiceError::Transport("reset".into()).is_fatal());
    }
}
