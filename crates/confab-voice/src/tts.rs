//! Speech synthesis: remote backend with bounded retry, local fallback.
//!
//! The pipeline makes strictly sequential remote attempts (never parallel
//! fan-out) with a linear backoff between them. When every attempt fails it
//! renders the apology line through a local, always-available fallback and
//! still returns the original error, so the orchestrator's error policy sees
//! the failure while the user hears an acknowledgment.

use crate::audio::pcm_f32_to_wav;
use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;
use tracing::{info, warn};

/// Spoken when synthesis fails or the dialogue backend lets us down.
pub const APOLOGY_LINE: &str = "Sorry, I missed that. Could you say it again?";

/// Backend that turns text into encoded audio bytes (WAV/MP3).
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. Empty output counts as a failure at
    /// the pipeline level.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Remote TTS over HTTP: `{"text", "voice_id", "format"}` in, audio bytes out.
#[derive(Debug, Clone)]
pub struct HttpTts {
    endpoint: String,
    api_key: Option<String>,
    voice_id: String,
    format: String,
    client: reqwest::blocking::Client,
}

impl HttpTts {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        voice_id: impl Into<String>,
        format: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            voice_id: voice_id.into(),
            format: format.into(),
            client,
        })
    }

    /// Build from `CONFAB_TTS_URL` / `CONFAB_TTS_API_KEY` / `CONFAB_VOICE_ID`
    /// / `CONFAB_TTS_FORMAT`.
    pub fn from_env() -> VoiceResult<Self> {
        let config = confab_core::ServiceConfig::from_env();
        Self::new(
            config.tts_url,
            config.tts_api_key,
            config.voice_id,
            config.audio_format,
        )
    }
}

impl TtsBackend for HttpTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "text": text,
            "voice_id": self.voice_id,
            "format": self.format,
        });
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let res = builder
            .send()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Local fallback synthesizer. There is no built-in speech engine to hand
/// the apology text to, so this renders a short two-tone WAV chime: the user
/// hears an acknowledgment while the text itself is surfaced as a notice.
#[derive(Debug, Clone)]
pub struct ChimeTts {
    sample_rate: u32,
}

impl Default for ChimeTts {
    fn default() -> Self {
        Self { sample_rate: 22050 }
    }
}

impl ChimeTts {
    fn tone(&self, freq: f32, duration: Duration, out: &mut Vec<f32>) {
        let n = (self.sample_rate as f32 * duration.as_secs_f32()) as usize;
        for i in 0..n {
            let t = i as f32 / self.sample_rate as f32;
            // Linear fade-out keeps the tone from clicking.
            let envelope = 1.0 - i as f32 / n as f32;
            out.push((t * freq * std::f32::consts::TAU).sin() * 0.3 * envelope);
        }
    }
}

impl TtsBackend for ChimeTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        info!("chime fallback for: {}", text);
        let mut samples = Vec::new();
        self.tone(440.0, Duration::from_millis(150), &mut samples);
        samples.extend(std::iter::repeat(0.0).take(self.sample_rate as usize / 20));
        self.tone(330.0, Duration::from_millis(220), &mut samples);
        Ok(pcm_f32_to_wav(&samples, self.sample_rate))
    }
}

/// A failed synthesis invocation: the original error plus the already
/// rendered apology audio (if the fallback produced any).
#[derive(Debug)]
pub struct SynthesisFailure {
    pub error: VoiceError,
    pub apology: Option<Vec<u8>>,
}

/// Bounded-retry synthesis with a hard local fallback.
pub struct SynthesisPipeline {
    remote: Box<dyn TtsBackend>,
    fallback: Box<dyn TtsBackend>,
    max_attempts: u32,
    base_delay: Duration,
}

impl SynthesisPipeline {
    /// Default total remote attempts per invocation.
    pub const MAX_ATTEMPTS: u32 = 2;
    /// Default delay multiplier between attempts.
    pub const BASE_DELAY: Duration = Duration::from_millis(1000);

    pub fn new(remote: Box<dyn TtsBackend>, fallback: Box<dyn TtsBackend>) -> Self {
        Self {
            remote,
            fallback,
            max_attempts: Self::MAX_ATTEMPTS,
            base_delay: Self::BASE_DELAY,
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    /// Remote backend from env, chime fallback.
    pub fn from_env() -> VoiceResult<Self> {
        Ok(Self::new(
            Box::new(HttpTts::from_env()?),
            Box::new(ChimeTts::default()),
        ))
    }

    /// Synthesize reply text. Retries are strictly sequential with
    /// `base_delay * attempt` between them; after the final failure the
    /// apology is rendered exactly once and the error still propagates.
    pub fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisFailure> {
        let mut last_error: Option<VoiceError> = None;

        for attempt in 1..=self.max_attempts {
            match self.remote.synthesize(text) {
                Ok(bytes) if !bytes.is_empty() => return Ok(bytes),
                Ok(_) => {
                    last_error = Some(VoiceError::Synthesis("empty audio response".to_string()));
                }
                Err(e) => {
                    warn!("TTS attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    last_error = Some(e);
                }
            }
            if attempt < self.max_attempts {
                std::thread::sleep(self.base_delay * attempt);
            }
        }

        let error = last_error
            .unwrap_or_else(|| VoiceError::Synthesis("no synthesis attempt made".to_string()));
        Err(SynthesisFailure {
            error,
            apology: self.apologize(),
        })
    }

    /// Render the apology line through the local fallback. Also used when the
    /// dialogue backend fails and there is nothing to synthesize.
    pub fn apologize(&self) -> Option<Vec<u8>> {
        match self.fallback.synthesize(APOLOGY_LINE) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                warn!("fallback synthesizer failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingTts {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    impl TtsBackend for CountingTts {
        fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(VoiceError::Synthesis("502 Bad Gateway".to_string()))
            } else {
                Ok(vec![1, 2, 3])
            }
        }
    }

    fn counting(calls: &Arc<AtomicU32>, fail: bool) -> Box<dyn TtsBackend> {
        Box::new(CountingTts {
            calls: Arc::clone(calls),
            fail,
        })
    }

    #[test]
    fn first_attempt_success_skips_retries_and_fallback() {
        let remote_calls = Arc::new(AtomicU32::new(0));
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let pipeline = SynthesisPipeline::new(
            counting(&remote_calls, false),
            counting(&fallback_calls, false),
        );

        let audio = pipeline.synthesize("hello there").unwrap();
        assert_eq!(audio, vec![1, 2, 3]);
        assert_eq!(remote_calls.load(Ordering::Relaxed), 1);
        assert_eq!(fallback_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn exhausted_retries_fall_back_once_and_still_error() {
        let remote_calls = Arc::new(AtomicU32::new(0));
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let pipeline = SynthesisPipeline::new(
            counting(&remote_calls, true),
            counting(&fallback_calls, false),
        )
        .with_retry_policy(2, Duration::ZERO);

        let failure = pipeline.synthesize("say this").unwrap_err();

        // Exactly two remote attempts, never a third.
        assert_eq!(remote_calls.load(Ordering::Relaxed), 2);
        // Apology rendered exactly once, and the original error survives.
        assert_eq!(fallback_calls.load(Ordering::Relaxed), 1);
        assert!(failure.apology.is_some());
        assert!(matches!(failure.error, VoiceError::Synthesis(msg) if msg.contains("502")));
    }

    #[test]
    fn failed_fallback_still_propagates_original_error() {
        let pipeline = SynthesisPipeline::new(
            counting(&Arc::new(AtomicU32::new(0)), true),
            counting(&Arc::new(AtomicU32::new(0)), true),
        )
        .with_retry_policy(2, Duration::ZERO);

        let failure = pipeline.synthesize("anything").unwrap_err();
        assert!(failure.apology.is_none());
        assert!(matches!(failure.error, VoiceError::Synthesis(_)));
    }

    #[test]
    fn chime_renders_playable_wav() {
        let chime = ChimeTts::default();
        let bytes = chime.synthesize(APOLOGY_LINE).unwrap();
        assert!(bytes.len() > 44);
        assert_eq!(&bytes[0..4], b"RIFF");
    }
}
