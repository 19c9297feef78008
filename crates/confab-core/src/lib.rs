//! # Confab Core
//!
//! Shared plumbing for the confab voice loop: environment-driven service
//! configuration, the rolling conversation history, and the dialogue client
//! that streams replies from the chat backend.
//!
//! The real-time audio side (capture, VAD, segmentation, STT/TTS, phase
//! state machine) lives in `confab-voice`; this crate is everything the
//! orchestrator needs that is not tied to an audio device.

pub mod config;
pub mod dialogue;
pub mod history;

pub use config::ServiceConfig;
pub use dialogue::{DialogueClient, DialogueError};
pub use history::{ConversationTurn, History, Role};
