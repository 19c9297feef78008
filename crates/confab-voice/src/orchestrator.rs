//! The conversation orchestrator: one actor task owning the phase machine.
//!
//! All phase mutation happens inside a single spawned task; everything else
//! observes the phase through a `watch` channel. A generation counter bumps
//! on every phase entry, every spawned turn pipeline and playback carries the
//! generation it started under, and events from superseded work are
//! discarded. That one mechanism covers barge-in, hold, stop, and late
//! network results alike.

use crate::audio::AudioSource;
use crate::error::{VoiceError, VoiceResult};
use crate::output::{AudioSink, PlaybackEvent};
use crate::segment::{SegmenterConfig, Utterance, UtteranceSegmenter};
use crate::stt::TranscriptionPipeline;
use crate::tts::SynthesisPipeline;
use crate::vad::{EnergyVad, VadConfig};
use confab_core::{ConversationTurn, History};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Session phase. Exactly one is active; only the orchestrator task writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session running.
    Idle,
    /// Capturing and segmenting user speech.
    Listening,
    /// Transcribing / waiting on the dialogue backend / synthesizing.
    Thinking,
    /// Playing the assistant's reply.
    Speaking,
    /// Held by the user; devices stay acquired.
    Paused,
    /// Recovering from a failure (or dead, if the failure was fatal).
    Error,
}

/// Synchronous triggers into the phase machine, consumed by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Stop,
    Hold,
    Resume,
    BargeIn,
}

/// User-visible happenings, for whatever front end is attached.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserSaid(String),
    AssistantSaid(String),
    Notice(String),
}

/// Seam to the chat backend. Implemented for `confab_core::DialogueClient`;
/// tests substitute their own.
#[async_trait::async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn reply(&self, user_text: &str, history: &[ConversationTurn]) -> VoiceResult<String>;
}

#[async_trait::async_trait]
impl DialogueBackend for confab_core::DialogueClient {
    async fn reply(&self, user_text: &str, history: &[ConversationTurn]) -> VoiceResult<String> {
        Ok(self.send(user_text, history).await?)
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// VAD/segmentation polling cadence (default 50ms).
    pub poll_interval: Duration,

    /// Consecutive recoverable errors tolerated before the session ends
    /// (default 3).
    pub error_ceiling: u32,

    /// Error backoff is `min(base * 2^errors, cap)`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    /// Turns of context sent to the dialogue backend (default 10).
    pub history_window: usize,

    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            error_ceiling: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(5000),
            history_window: History::DEFAULT_WINDOW,
            vad: VadConfig::default(),
            segmenter: SegmenterConfig::default(),
        }
    }
}

/// The capability objects a session drives.
pub struct SessionDeps {
    pub source: Box<dyn AudioSource>,
    pub sink: Box<dyn AudioSink>,
    pub transcription: Arc<TranscriptionPipeline>,
    pub synthesis: Arc<SynthesisPipeline>,
    pub dialogue: Arc<dyn DialogueBackend>,
}

/// Handle to a running session actor.
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    phase_rx: watch::Receiver<Phase>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Send a control trigger. Fails only if the actor is gone.
    pub fn command(&self, cmd: SessionCommand) -> VoiceResult<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    /// A watch receiver for phase changes (cloneable, `wait_for`-able).
    pub fn phase_receiver(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    /// Take the session event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// End the actor and wait for it to release its devices.
    pub async fn shutdown(self) {
        drop(self.cmd_tx);
        let _ = self.task.await;
    }
}

/// Spawn a session actor over the given capabilities.
pub struct VoiceSession;

impl VoiceSession {
    pub fn spawn(config: OrchestratorConfig, deps: SessionDeps) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        let (play_tx, play_rx) = mpsc::unbounded_channel();

        let vad = match EnergyVad::new(config.vad.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("VAD unavailable, degrading segmentation: {}", e);
                None
            }
        };
        let segmenter = if vad.is_some() {
            UtteranceSegmenter::new(config.segmenter.clone())
        } else {
            UtteranceSegmenter::degraded(config.segmenter.clone())
        };
        let history = History::new(config.history_window);

        let actor = Actor {
            config,
            deps,
            phase: Phase::Idle,
            generation: 0,
            error_count: 0,
            backoff_until: None,
            vad,
            segmenter,
            history,
            phase_tx,
            event_tx,
            cmd_rx,
            pipe_rx,
            pipe_tx,
            play_rx,
            play_tx,
        };
        let task = tokio::spawn(actor.run());

        SessionHandle {
            cmd_tx,
            phase_rx,
            event_rx: Some(event_rx),
            task,
        }
    }
}

/// Output of one turn pipeline stage, tagged with the generation it was
/// started under.
enum PipelineEvent {
    Transcript {
        generation: u64,
        text: String,
    },
    Reply {
        generation: u64,
        text: String,
    },
    Audio {
        generation: u64,
        bytes: Vec<u8>,
    },
    Failed {
        generation: u64,
        error: VoiceError,
        apology: Option<Vec<u8>>,
    },
}

struct Actor {
    config: OrchestratorConfig,
    deps: SessionDeps,

    phase: Phase,
    generation: u64,
    error_count: u32,
    backoff_until: Option<tokio::time::Instant>,

    vad: Option<EnergyVad>,
    segmenter: UtteranceSegmenter,
    history: History,

    phase_tx: watch::Sender<Phase>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    pipe_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    pipe_tx: mpsc::UnboundedSender<PipelineEvent>,
    play_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    play_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Actor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff = self.backoff_until;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Handle dropped: tear the session down and exit.
                        self.stop_session();
                        break;
                    }
                },
                _ = tick.tick(), if self.phase == Phase::Listening => {
                    self.poll_audio();
                }
                Some(event) = self.pipe_rx.recv() => self.handle_pipeline_event(event),
                Some(event) = self.play_rx.recv() => self.handle_playback_event(event),
                _ = tokio::time::sleep_until(backoff.unwrap_or_else(tokio::time::Instant::now)),
                    if backoff.is_some() => {
                    self.finish_backoff();
                }
            }
        }
        debug!("session actor finished");
    }

    /// The single place the phase changes. Bumps the generation so anything
    /// started under the old phase becomes stale.
    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            info!("phase {:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
        self.generation = self.generation.wrapping_add(1);
        let _ = self.phase_tx.send(phase);
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match (self.phase, cmd) {
            (Phase::Idle, SessionCommand::Start) => match self.deps.source.open() {
                Ok(()) => {
                    self.error_count = 0;
                    self.enter_listening();
                    self.notify("Listening.");
                }
                Err(e) => self.fatal_error(e),
            },
            (_, SessionCommand::Stop) => {
                self.stop_session();
            }
            (Phase::Listening | Phase::Speaking, SessionCommand::Hold) => {
                self.deps.source.pause();
                self.deps.sink.pause();
                self.set_phase(Phase::Paused);
                self.notify("On hold.");
            }
            (Phase::Paused, SessionCommand::Resume) => {
                // A reply held mid-playback is discarded, not replayed.
                self.deps.sink.stop();
                self.enter_listening();
                self.notify("Resumed.");
            }
            (Phase::Speaking, SessionCommand::BargeIn) => {
                // Kill playback before capture resumes so the tail of the
                // reply cannot leak into the next utterance.
                self.deps.sink.stop();
                self.enter_listening();
                self.notify("Go ahead.");
            }
            (phase, cmd) => debug!("ignoring {:?} in phase {:?}", cmd, phase),
        }
    }

    fn enter_listening(&mut self) {
        self.segmenter.reset();
        self.backoff_until = None;
        self.deps.source.resume();
        self.set_phase(Phase::Listening);
    }

    fn stop_session(&mut self) {
        self.deps.sink.stop();
        self.deps.source.close();
        self.segmenter.reset();
        self.history.clear();
        self.backoff_until = None;
        self.error_count = 0;
        self.set_phase(Phase::Idle);
        info!("session stopped");
    }

    /// Drain captured frames through VAD into the segmenter, then check the
    /// finalize conditions. Only ever called while listening.
    fn poll_audio(&mut self) {
        while let Some(frame) = self.deps.source.try_next() {
            match self.vad {
                Some(ref vad) => {
                    let decision = vad.classify(&frame);
                    self.segmenter.observe(&decision, &frame.samples);
                }
                None => self.segmenter.observe_raw(frame.timestamp, &frame.samples),
            }
        }
        if let Some(utterance) = self.segmenter.poll(Instant::now()) {
            self.begin_turn(utterance);
        }
    }

    /// Listening -> thinking: hand the utterance to a turn pipeline task.
    /// Exactly one pipeline is in flight; capture is suspended until the
    /// turn's playback (or failure handling) finishes.
    fn begin_turn(&mut self, utterance: Utterance) {
        self.deps.source.pause();
        self.set_phase(Phase::Thinking);

        let generation = self.generation;
        let transcription = Arc::clone(&self.deps.transcription);
        let synthesis = Arc::clone(&self.deps.synthesis);
        let dialogue = Arc::clone(&self.deps.dialogue);
        let history = self.history.window().to_vec();
        let pipe_tx = self.pipe_tx.clone();

        tokio::spawn(run_turn_pipeline(
            generation,
            utterance,
            transcription,
            dialogue,
            synthesis,
            history,
            pipe_tx,
        ));
    }

    fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Transcript { generation, text } if generation == self.generation => {
                info!("🗣️ user: {}", text);
                self.history.push(ConversationTurn::user(text.clone()));
                let _ = self.event_tx.send(SessionEvent::UserSaid(text));
            }
            PipelineEvent::Reply { generation, text } if generation == self.generation => {
                info!("💬 assistant: {}", text);
                self.history.push(ConversationTurn::assistant(text.clone()));
                let _ = self.event_tx.send(SessionEvent::AssistantSaid(text));
            }
            PipelineEvent::Audio { generation, bytes } if generation == self.generation => {
                self.set_phase(Phase::Speaking);
                let playback_generation = self.generation;
                if let Err(e) =
                    self.deps
                        .sink
                        .play(bytes, playback_generation, self.play_tx.clone())
                {
                    self.recoverable_error(e, None);
                }
            }
            PipelineEvent::Failed {
                generation,
                error,
                apology,
            } if generation == self.generation => {
                if error.is_fatal() {
                    self.fatal_error(error);
                } else {
                    self.recoverable_error(error, apology);
                }
            }
            _ => debug!("discarding stale pipeline event"),
        }
    }

    /// Terminal playback events only drive transitions out of `speaking`;
    /// an apology chime finishing during `error` must not end the backoff or
    /// reset the error streak.
    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Completed { generation }
                if generation == self.generation && self.phase == Phase::Speaking =>
            {
                // Full turn delivered: the error streak is over.
                self.error_count = 0;
                self.enter_listening();
            }
            PlaybackEvent::Stopped { generation }
                if generation == self.generation && self.phase == Phase::Speaking =>
            {
                self.enter_listening();
            }
            PlaybackEvent::Failed { generation }
                if generation == self.generation && self.phase == Phase::Speaking =>
            {
                self.recoverable_error(
                    VoiceError::Playback("terminal playback failure".to_string()),
                    None,
                );
            }
            _ => debug!("discarding stale or out-of-phase playback event"),
        }
    }

    /// Count the failure, speak the apology if one was rendered, and either
    /// back off into listening or end the session at the ceiling.
    fn recoverable_error(&mut self, error: VoiceError, apology: Option<Vec<u8>>) {
        self.error_count += 1;
        warn!(
            "turn failed ({} consecutive): {}",
            self.error_count, error
        );
        let _ = self.event_tx.send(SessionEvent::Notice(format!(
            "{} — {}",
            crate::tts::APOLOGY_LINE,
            error
        )));

        if self.error_count > self.config.error_ceiling {
            error!("error ceiling reached, ending session");
            self.stop_session();
            return;
        }

        self.set_phase(Phase::Error);
        if let Some(bytes) = apology {
            let generation = self.generation;
            if let Err(e) = self.deps.sink.play(bytes, generation, self.play_tx.clone()) {
                debug!("apology playback failed: {}", e);
            }
        }

        let delay = backoff_delay(
            self.config.backoff_base,
            self.config.backoff_cap,
            self.error_count,
        );
        debug!("retrying into listening in {:?}", delay);
        self.backoff_until = Some(tokio::time::Instant::now() + delay);
    }

    fn finish_backoff(&mut self) {
        self.backoff_until = None;
        if self.phase == Phase::Error {
            self.deps.sink.stop();
            self.enter_listening();
        }
    }

    /// Device loss: release everything and park in `error`. No auto-retry;
    /// the user must stop and start again.
    fn fatal_error(&mut self, error: VoiceError) {
        error!("fatal: {}", error);
        let _ = self
            .event_tx
            .send(SessionEvent::Notice(format!("Session failed: {}", error)));
        self.deps.sink.stop();
        self.deps.source.close();
        self.backoff_until = None;
        self.set_phase(Phase::Error);
    }

    fn notify(&self, message: &str) {
        let _ = self
            .event_tx
            .send(SessionEvent::Notice(message.to_string()));
    }
}

/// Backoff before re-entering listening after the nth consecutive
/// recoverable error: base * 2^(n-1), capped. The first retry waits the
/// base delay itself.
fn backoff_delay(base: Duration, cap: Duration, errors: u32) -> Duration {
    let exponent = errors.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// One utterance's journey: STT -> dialogue -> TTS. Runs off the actor task;
/// the sync STT/TTS backends execute under `spawn_blocking`. Every outcome is
/// reported as exactly one `Audio` or `Failed` event (plus the intermediate
/// transcript/reply events), all tagged with the starting generation.
async fn run_turn_pipeline(
    generation: u64,
    utterance: Utterance,
    transcription: Arc<TranscriptionPipeline>,
    dialogue: Arc<dyn DialogueBackend>,
    synthesis: Arc<SynthesisPipeline>,
    history: Vec<ConversationTurn>,
    pipe_tx: mpsc::UnboundedSender<PipelineEvent>,
) {
    let fail = |error: VoiceError, apology: Option<Vec<u8>>| PipelineEvent::Failed {
        generation,
        error,
        apology,
    };

    // Tier-1/tier-2 STT. The utterance buffer is consumed here.
    let stt = Arc::clone(&transcription);
    let transcript = match tokio::task::spawn_blocking(move || stt.transcribe(utterance)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            let _ = pipe_tx.send(fail(e, None));
            return;
        }
        Err(e) => {
            let _ = pipe_tx.send(fail(VoiceError::Transcription(e.to_string()), None));
            return;
        }
    };
    let _ = pipe_tx.send(PipelineEvent::Transcript {
        generation,
        text: transcript.clone(),
    });

    // Dialogue. On failure the user still gets a spoken acknowledgment.
    let reply = match dialogue.reply(&transcript, &history).await {
        Ok(text) => text,
        Err(e) => {
            let apologize = Arc::clone(&synthesis);
            let apology = tokio::task::spawn_blocking(move || apologize.apologize())
                .await
                .ok()
                .flatten();
            let _ = pipe_tx.send(fail(e, apology));
            return;
        }
    };
    let _ = pipe_tx.send(PipelineEvent::Reply {
        generation,
        text: reply.clone(),
    });

    // Synthesis with retry + fallback.
    match tokio::task::spawn_blocking(move || synthesis.synthesize(&reply)).await {
        Ok(Ok(bytes)) => {
            let _ = pipe_tx.send(PipelineEvent::Audio { generation, bytes });
        }
        Ok(Err(failure)) => {
            let _ = pipe_tx.send(fail(failure.error, failure.apology));
        }
        Err(e) => {
            let _ = pipe_tx.send(fail(VoiceError::Synthesis(e.to_string()), None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_policy() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.poll_interval, Duration::from_millis(50));
        assert_eq!(c.error_ceiling, 3);
        assert_eq!(c.backoff_cap, Duration::from_millis(5000));
        assert_eq!(c.history_window, 10);
    }

    #[test]
    fn backoff_curve_starts_at_base_and_caps() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(5000);
        let delays: Vec<u128> = (1u32..=5)
            .map(|n| backoff_delay(base, cap, n).as_millis())
            .collect();
        // The first retry waits the base delay, then doubles to the cap.
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }
}
