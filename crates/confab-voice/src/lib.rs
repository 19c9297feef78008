//! # Confab Voice - Conversational Voice Orchestration
//!
//! Real-time voice-interaction loop: capture the microphone, detect speech by
//! RMS energy, segment utterances, transcribe, ask the dialogue backend, and
//! speak the reply — continuously, like a live phone call, with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Conversation Orchestrator                        │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────────┐            │
//! │  │  Audio In  │ → │ Energy VAD │ → │  Segmenter    │            │
//! │  │   (cpal)   │   │ (RMS 0.04) │   │ (800ms gap)   │            │
//! │  └────────────┘   └────────────┘   └───────────────┘            │
//! │        ↑                                   ↓ utterance           │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────────┐            │
//! │  │ Audio Out  │ ← │  TTS retry │ ← │ STT two-tier  │→ dialogue  │
//! │  │  (rodio)   │   │ + fallback │   │ sticky fallbk │   (SSE)    │
//! │  └────────────┘   └────────────┘   └───────────────┘            │
//! │        ↑ barge-in kill-switch, phase machine, generations        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator is a single actor task: it alone mutates the session
//! phase, and a generation counter bumped on every phase entry lets it
//! discard results from superseded work (barge-in, hold, stop, late
//! network replies).

pub mod audio;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod segment;
pub mod stt;
pub mod tts;
pub mod vad;

pub use audio::{pcm_f32_to_wav, AudioConfig, AudioFrame, AudioSource, CpalSource};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::{
    DialogueBackend, OrchestratorConfig, Phase, SessionCommand, SessionDeps, SessionEvent,
    SessionHandle, VoiceSession,
};
pub use output::{AudioSink, PlaybackEvent, RodioSink};
pub use segment::{SegmenterConfig, Utterance, UtteranceSegmenter};
pub use stt::{HttpStt, SpeechRecognizer, TranscriptionPipeline};
#[cfg(feature = "whisper")]
pub use stt::WhisperRecognizer;
pub use tts::{ChimeTts, HttpTts, SynthesisPipeline, TtsBackend, APOLOGY_LINE};
pub use vad::{rms, rms_unsigned_u8, EnergyVad, VadConfig, VadDecision};
