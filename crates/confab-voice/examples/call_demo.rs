//! Call Demo — the full live loop against real devices and backends.
//!
//! Speak; trailing silence finalizes your utterance, the transcript goes to
//! the chat backend, and the reply is spoken back. Speaking over the reply
//! barges in. Configure endpoints via `.env` (see `confab-core::config`);
//! without a reachable backend the loop still runs and reports errors with
//! the chime fallback.
//!
//! Press Ctrl+C to stop.

use confab_core::{DialogueClient, ServiceConfig};
use confab_voice::{
    AudioConfig, CpalSource, OrchestratorConfig, RodioSink, SessionCommand, SessionDeps,
    SessionEvent, SynthesisPipeline, TranscriptionPipeline, VoiceSession,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let services = ServiceConfig::from_env();
    info!("Call Demo — mic → VAD → STT → chat → TTS → speaker");
    info!("chat: {}  stt: {}  tts: {}", services.chat_url, services.stt_url, services.tts_url);
    info!("Press Ctrl+C to stop.\n");

    let deps = SessionDeps {
        source: Box::new(CpalSource::new(AudioConfig::default())),
        sink: Box::new(RodioSink::new()?),
        transcription: Arc::new(TranscriptionPipeline::from_env()?),
        synthesis: Arc::new(SynthesisPipeline::from_env()?),
        dialogue: Arc::new(DialogueClient::new(
            services.chat_url.clone(),
            services.chat_api_key.clone(),
        )),
    };

    let mut session = VoiceSession::spawn(OrchestratorConfig::default(), deps);
    let mut events = session
        .take_events()
        .ok_or("session events already taken")?;
    session.command(SessionCommand::Start)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping session");
                session.command(SessionCommand::Stop)?;
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::UserSaid(text)) => info!("you: {}", text),
                Some(SessionEvent::AssistantSaid(text)) => info!("assistant: {}", text),
                Some(SessionEvent::Notice(text)) => info!("[{}]", text),
                None => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}
