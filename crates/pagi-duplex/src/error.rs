//! Error types for the PAGI Duplex core
//!
//! Only conditions that cannot be recovered locally surface as `DuplexError`.
//! Stale VAD sources, queue overflow, schedule drift and uncertain barge-in
//! classifications are handled in place and reported through telemetry.

use thiserror::Error;

/// Result type alias for duplex operations
pub type DuplexResult<T> = Result<T, DuplexError>;

/// Errors that can occur in the duplex turn-taking core
#[derive(Error, Debug)]
pub enum DuplexError {
    #[error("Hardware clock unavailable: {0}")]
    HardwareClock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Invalid audio chunk: {0}")]
    InvalidChunk(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DuplexError {
    /// True for failures that end the current conversational turn and force a
    /// session-level reset (hardware clock, command channel, audio device).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DuplexError::HardwareClock(_)
                | DuplexError::ChannelSend(_)
                | DuplexError::AudioDevice(_)
                | DuplexError::AudioStream(_)
        )
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for DuplexError {
    fn from(err: cpal::DevicesError) -> Self {
        DuplexError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for DuplexError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        DuplexError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for DuplexError {
    fn from(err: cpal::BuildStreamError) -> Self {
        DuplexError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for DuplexError {
    fn from(err: cpal::PlayStreamError) -> Self {
        DuplexError::AudioStream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(DuplexError::HardwareClock("gone".into()).is_fatal());
        assert!(DuplexError::ChannelSend("closed".into()).is_fatal());
        assert!(!DuplexError::Config("bad".into()).is_fatal());
        assert!(!DuplexError::VadProcessing("frame".into()).is_fatal());
    }
}
