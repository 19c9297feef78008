//! Speech-to-text: recognizer backends and the two-tier pipeline.
//!
//! The pipeline tries a remote primary until it has failed twice in a
//! session, then a local secondary (Whisper when built with the `whisper`
//! feature, otherwise absent). One secondary success makes the pipeline
//! sticky: the primary is never probed again for the rest of the session.

use crate::audio::pcm_f32_to_wav;
use crate::error::{VoiceError, VoiceResult};
use crate::segment::Utterance;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Backend for converting a finalized utterance into text.
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe one utterance. An empty string means nothing was heard.
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String>;
}

/// Remote STT over HTTP: raw WAV body in, `{"text": "..."}` out.
#[derive(Debug, Clone)]
pub struct HttpStt {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpStt {
    /// Create a client for the given transcription endpoint.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }
}

impl SpeechRecognizer for HttpStt {
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(&utterance.samples, utterance.sample_rate);
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let res = builder
            .send()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| VoiceError::Transcription("malformed STT response".to_string()))?;
        Ok(text.trim().to_string())
    }
}

// -----------------------------------------------------------------------------
// Local Whisper secondary (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// On-device Whisper recognizer, used as the local secondary tier.
    /// Loads a ggml quantized model (e.g. ggml-base.en.bin); audio must be
    /// 16 kHz mono f32, which is the capture default.
    pub struct WhisperRecognizer {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    impl WhisperRecognizer {
        /// Load the model from `model_path`.
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Transcription(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Transcription(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    impl SpeechRecognizer for WhisperRecognizer {
        fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
            if utterance.samples.is_empty() {
                return Ok(String::new());
            }
            if utterance.sample_rate != 16000 {
                return Err(VoiceError::Transcription(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    utterance.sample_rate
                )));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Transcription(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(&params, &utterance.samples)
                .map_err(|e| VoiceError::Transcription(format!("Whisper inference failed: {}", e)))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(text)
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperRecognizer;

/// Two-tier transcription with sticky fallback. Session-scoped state lives in
/// atomics so the pipeline can be shared across turn tasks behind an `Arc`.
pub struct TranscriptionPipeline {
    primary: Box<dyn SpeechRecognizer>,
    secondary: Option<Box<dyn SpeechRecognizer>>,
    max_primary_retries: u32,
    primary_failures: AtomicU32,
    secondary_sticky: AtomicBool,
}

impl TranscriptionPipeline {
    /// Default number of primary failures tolerated per session.
    pub const MAX_PRIMARY_RETRIES: u32 = 2;

    pub fn new(
        primary: Box<dyn SpeechRecognizer>,
        secondary: Option<Box<dyn SpeechRecognizer>>,
    ) -> Self {
        Self {
            primary,
            secondary,
            max_primary_retries: Self::MAX_PRIMARY_RETRIES,
            primary_failures: AtomicU32::new(0),
            secondary_sticky: AtomicBool::new(false),
        }
    }

    pub fn with_max_primary_retries(mut self, retries: u32) -> Self {
        self.max_primary_retries = retries;
        self
    }

    /// Build from environment: remote primary from `CONFAB_STT_URL` /
    /// `CONFAB_STT_API_KEY`, Whisper secondary when the `whisper` feature is
    /// enabled and `WHISPER_MODEL_PATH` loads.
    pub fn from_env() -> VoiceResult<Self> {
        let config = confab_core::ServiceConfig::from_env();
        let primary = HttpStt::new(config.stt_url, config.stt_api_key)?;

        #[allow(unused_mut)]
        let mut secondary: Option<Box<dyn SpeechRecognizer>> = None;
        #[cfg(feature = "whisper")]
        {
            match whisper_stt::WhisperRecognizer::from_env() {
                Ok(w) => {
                    info!("local Whisper secondary loaded");
                    secondary = Some(Box::new(w));
                }
                Err(e) => debug!("no local Whisper secondary: {}", e),
            }
        }

        Ok(Self::new(Box::new(primary), secondary))
    }

    /// Whether the session has locked onto the secondary tier.
    pub fn is_sticky(&self) -> bool {
        self.secondary_sticky.load(Ordering::Relaxed)
    }

    /// Transcribe a finalized utterance. Takes the buffer by value: it is
    /// consumed by this call and dropped on return, success or failure.
    pub fn transcribe(&self, utterance: Utterance) -> VoiceResult<String> {
        let sticky = self.secondary_sticky.load(Ordering::Relaxed);
        let failures = self.primary_failures.load(Ordering::Relaxed);
        let mut primary_error: Option<VoiceError> = None;

        if !sticky && failures < self.max_primary_retries {
            match self.primary.transcribe(&utterance) {
                Ok(text) => return accept(text),
                Err(e) => {
                    let total = self.primary_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("primary STT failed ({} of {} tolerated): {}", total, self.max_primary_retries, e);
                    primary_error = Some(e);
                }
            }
        } else if !sticky {
            debug!("primary STT disabled after {} failures", failures);
        }

        if let Some(ref secondary) = self.secondary {
            match secondary.transcribe(&utterance) {
                Ok(text) => {
                    if !self.secondary_sticky.swap(true, Ordering::Relaxed) {
                        info!("secondary STT succeeded; sticking to it for this session");
                    }
                    return accept(text);
                }
                Err(e) => warn!("secondary STT failed: {}", e),
            }
        }

        Err(match primary_error {
            Some(e) if self.secondary.is_none() => e,
            _ => VoiceError::Transcription("both transcription methods failed".to_string()),
        })
    }
}

fn accept(text: String) -> VoiceResult<String> {
    let text = text.trim().to_string();
    if text.is_empty() {
        Err(VoiceError::NoSpeech)
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    fn utterance() -> Utterance {
        Utterance {
            samples: vec![0.1; 1024],
            sample_rate: 16000,
            timestamp: Utc::now(),
            duration: Duration::from_secs(1),
        }
    }

    struct CountingRecognizer {
        calls: Arc<AtomicU32>,
        result: VoiceResult<String>,
    }

    impl CountingRecognizer {
        fn ok(calls: Arc<AtomicU32>, text: &str) -> Box<dyn SpeechRecognizer> {
            Box::new(Self {
                calls,
                result: Ok(text.to_string()),
            })
        }

        fn failing(calls: Arc<AtomicU32>) -> Box<dyn SpeechRecognizer> {
            Box::new(Self {
                calls,
                result: Err(VoiceError::Transcription("503".to_string())),
            })
        }
    }

    impl SpeechRecognizer for CountingRecognizer {
        fn transcribe(&self, _utterance: &Utterance) -> VoiceResult<String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.result {
                Ok(ref t) => Ok(t.clone()),
                Err(ref e) => Err(VoiceError::Transcription(e.to_string())),
            }
        }
    }

    #[test]
    fn primary_success_never_touches_secondary() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let secondary_calls = Arc::new(AtomicU32::new(0));
        let pipeline = TranscriptionPipeline::new(
            CountingRecognizer::ok(primary_calls.clone(), "hello"),
            Some(CountingRecognizer::ok(secondary_calls.clone(), "unused")),
        );

        assert_eq!(pipeline.transcribe(utterance()).unwrap(), "hello");
        assert_eq!(primary_calls.load(Ordering::Relaxed), 1);
        assert_eq!(secondary_calls.load(Ordering::Relaxed), 0);
        assert!(!pipeline.is_sticky());
    }

    #[test]
    fn secondary_success_is_sticky_for_the_session() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let secondary_calls = Arc::new(AtomicU32::new(0));
        let pipeline = TranscriptionPipeline::new(
            CountingRecognizer::failing(primary_calls.clone()),
            Some(CountingRecognizer::ok(secondary_calls.clone(), "fallback text")),
        );

        // First call: primary fails once, secondary succeeds and sticks.
        assert_eq!(pipeline.transcribe(utterance()).unwrap(), "fallback text");
        assert!(pipeline.is_sticky());
        assert_eq!(primary_calls.load(Ordering::Relaxed), 1);

        // Subsequent calls never probe the primary again.
        for _ in 0..3 {
            assert_eq!(pipeline.transcribe(utterance()).unwrap(), "fallback text");
        }
        assert_eq!(primary_calls.load(Ordering::Relaxed), 1);
        assert_eq!(secondary_calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn primary_is_abandoned_after_retry_budget() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let pipeline = TranscriptionPipeline::new(
            CountingRecognizer::failing(primary_calls.clone()),
            None,
        );

        for _ in 0..5 {
            assert!(pipeline.transcribe(utterance()).is_err());
        }
        // Two tolerated failures, then never again.
        assert_eq!(primary_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn both_tiers_failing_reports_combined_failure() {
        let pipeline = TranscriptionPipeline::new(
            CountingRecognizer::failing(Arc::new(AtomicU32::new(0))),
            Some(CountingRecognizer::failing(Arc::new(AtomicU32::new(0)))),
        );
        let err = pipeline.transcribe(utterance()).unwrap_err();
        assert!(matches!(err, VoiceError::Transcription(msg) if msg.contains("both")));
    }

    #[test]
    fn whitespace_transcript_is_no_speech() {
        let pipeline = TranscriptionPipeline::new(
            CountingRecognizer::ok(Arc::new(AtomicU32::new(0)), "   "),
            None,
        );
        assert!(matches!(
            pipeline.transcribe(utterance()),
            Err(VoiceError::NoSpeech)
        ));
    }
}
