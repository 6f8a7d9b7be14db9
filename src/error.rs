//! Error taxonomy for the voice and chat core.
//!
//! Library code returns [`VoiceError`]; the binary and config loading
//! wrap it in `anyhow` with context.

use thiserror::Error;

/// Errors surfaced by the assistant core.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone access refused or no capture device present.
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// Remote session failure (connect, protocol, or socket error).
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be decoded (bad base64, bad WAV, bad JSON).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// No API key configured.
    #[error("API key not set (export GEMINI_API_KEY or API_KEY, or set gemini.api_key)")]
    UnsetCredential,

    /// A voice session is already running.
    #[error("voice session already active")]
    AlreadyActive,

    /// `stop` arrived while a `start` was still acquiring resources.
    #[error("voice session start cancelled")]
    Cancelled,

    /// Upload quota exhausted for the current window.
    #[error("upload limit reached ({used}/{limit})")]
    UploadLimitReached { used: u32, limit: u32 },

    /// Output device failure or unsupported stream format.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// An acquisition or handshake did not finish in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Streaming chat request failed.
    #[error("chat request failed: {0}")]
    Chat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the library.
pub type VoiceResult<T> = Result<T, VoiceError>;

impl VoiceError {
    /// Whether the user can retry the operation without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Chat(_) | Self::AudioDevice(_)
        )
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::MalformedInput(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Chat(err.to_string())
    }
}
