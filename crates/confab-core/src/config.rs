//! Service configuration from environment variables.
//!
//! Load a `.env` file with `dotenvy` before calling [`ServiceConfig::from_env`]
//! (binaries and examples do this; libraries never touch the process env
//! implicitly).
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `CONFAB_CHAT_URL` | Dialogue endpoint (SSE reply stream) | `http://127.0.0.1:8080/api/chat` |
//! | `CONFAB_STT_URL` | Transcription endpoint | `http://127.0.0.1:8080/api/transcribe` |
//! | `CONFAB_TTS_URL` | Synthesis endpoint | `http://127.0.0.1:8080/api/voice` |
//! | `CONFAB_API_KEY` | Bearer key shared by all services | unset |
//! | `CONFAB_CHAT_API_KEY` | Per-service override | falls back to `CONFAB_API_KEY` |
//! | `CONFAB_STT_API_KEY` | Per-service override | falls back to `CONFAB_API_KEY` |
//! | `CONFAB_TTS_API_KEY` | Per-service override | falls back to `CONFAB_API_KEY` |
//! | `CONFAB_VOICE_ID` | TTS voice | `naija_male_warm` |
//! | `CONFAB_TTS_FORMAT` | TTS audio container (`mp3`/`wav`) | `mp3` |

const DEFAULT_CHAT_URL: &str = "http://127.0.0.1:8080/api/chat";
const DEFAULT_STT_URL: &str = "http://127.0.0.1:8080/api/transcribe";
const DEFAULT_TTS_URL: &str = "http://127.0.0.1:8080/api/voice";
const DEFAULT_VOICE_ID: &str = "naija_male_warm";
const DEFAULT_TTS_FORMAT: &str = "mp3";

/// Endpoints and credentials for the three external collaborators.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Dialogue endpoint (streamed chat replies).
    pub chat_url: String,
    /// Transcription endpoint (raw audio in, `{text}` out).
    pub stt_url: String,
    /// Synthesis endpoint (`{text, voice_id, format}` in, audio bytes out).
    pub tts_url: String,
    /// Bearer key for the chat endpoint, if any.
    pub chat_api_key: Option<String>,
    /// Bearer key for the STT endpoint, if any.
    pub stt_api_key: Option<String>,
    /// Bearer key for the TTS endpoint, if any.
    pub tts_api_key: Option<String>,
    /// Voice used for synthesis.
    pub voice_id: String,
    /// Encoded audio container requested from the TTS backend.
    pub audio_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            chat_url: DEFAULT_CHAT_URL.to_string(),
            stt_url: DEFAULT_STT_URL.to_string(),
            tts_url: DEFAULT_TTS_URL.to_string(),
            chat_api_key: None,
            stt_api_key: None,
            tts_api_key: None,
            voice_id: DEFAULT_VOICE_ID.to_string(),
            audio_format: DEFAULT_TTS_FORMAT.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Build from environment. Per-service keys fall back to `CONFAB_API_KEY`;
    /// everything else falls back to the defaults above.
    pub fn from_env() -> Self {
        let shared_key = non_empty_var("CONFAB_API_KEY");
        Self {
            chat_url: non_empty_var("CONFAB_CHAT_URL")
                .unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            stt_url: non_empty_var("CONFAB_STT_URL")
                .unwrap_or_else(|| DEFAULT_STT_URL.to_string()),
            tts_url: non_empty_var("CONFAB_TTS_URL")
                .unwrap_or_else(|| DEFAULT_TTS_URL.to_string()),
            chat_api_key: non_empty_var("CONFAB_CHAT_API_KEY").or_else(|| shared_key.clone()),
            stt_api_key: non_empty_var("CONFAB_STT_API_KEY").or_else(|| shared_key.clone()),
            tts_api_key: non_empty_var("CONFAB_TTS_API_KEY").or(shared_key),
            voice_id: non_empty_var("CONFAB_VOICE_ID")
                .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
            audio_format: non_empty_var("CONFAB_TTS_FORMAT")
                .unwrap_or_else(|| DEFAULT_TTS_FORMAT.to_string()),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local() {
        let c = ServiceConfig::default();
        assert!(c.chat_url.starts_with("http://127.0.0.1"));
        assert_eq!(c.voice_id, "naija_male_warm");
        assert_eq!(c.audio_format, "mp3");
        assert!(c.chat_api_key.is_none());
    }
}
