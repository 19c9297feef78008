//! Error types for the voice orchestration system

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the voice loop.
///
/// Only [`VoiceError::AudioDevice`] is fatal to a session; everything else is
/// recoverable and handled by the orchestrator's retry/backoff policy.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("No speech detected in utterance")]
    NoSpeech,

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Dialogue error: {0}")]
    Dialogue(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Device loss has no auto-recovery path; the session must be restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::AudioDevice(_))
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<confab_core::DialogueError> for VoiceError {
    fn from(err: confab_core::DialogueError) -> Self {
        VoiceError::Dialogue(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_errors_are_fatal() {
        assert!(VoiceError::AudioDevice("gone".into()).is_fatal());
        assert!(!VoiceError::Transcription("timeout".into()).is_fatal());
        assert!(!VoiceError::NoSpeech.is_fatal());
        assert!(!VoiceError::Synthesis("502".into()).is_fatal());
    }
}
