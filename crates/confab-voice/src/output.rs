//! Playback behind the `AudioSink` seam.
//!
//! `RodioSink` runs playback on its own thread because `rodio::OutputStream`
//! is not `Send`. Every `play` carries the orchestrator's generation counter
//! and a terminal-event channel; the sink guarantees exactly one terminal
//! event per invocation (completed, stopped, or failed), never more.
//! `stop()` is the barge-in kill-switch; `pause` implements hold without
//! releasing the output device (a held reply is later discarded with `stop`).

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL: Duration = Duration::from_millis(25);

/// The single terminal event of one playback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio ran to the end.
    Completed { generation: u64 },
    /// Playback was killed by `stop()` before finishing.
    Stopped { generation: u64 },
    /// The audio could not be decoded or queued.
    Failed { generation: u64 },
}

/// Capability seam for the playback device.
pub trait AudioSink: Send {
    /// Queue encoded audio (WAV/MP3) for playback. The terminal event is
    /// delivered on `done`, tagged with `generation`.
    fn play(
        &mut self,
        audio: Vec<u8>,
        generation: u64,
        done: tokio::sync::mpsc::UnboundedSender<PlaybackEvent>,
    ) -> VoiceResult<()>;

    /// Kill current playback immediately (barge-in).
    fn stop(&mut self);

    /// Suspend playback in place (hold). A held reply is only ever discarded
    /// with `stop`, never resumed.
    fn pause(&mut self);
}

enum SinkCommand {
    Play {
        audio: Vec<u8>,
        generation: u64,
        done: tokio::sync::mpsc::UnboundedSender<PlaybackEvent>,
    },
    Stop,
    Pause,
}

/// Speaker output via rodio, driven from a dedicated playback thread.
pub struct RodioSink {
    cmd_tx: std_mpsc::Sender<SinkCommand>,
    thread: Option<JoinHandle<()>>,
}

impl RodioSink {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SinkCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

        let thread = std::thread::spawn(move || {
            let (stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
            };
            let sink = match Sink::try_new(&handle) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            playback_loop(cmd_rx, &sink);
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("🔊 playback sink ready");
                Ok(Self {
                    cmd_tx,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Playback(
                    "playback thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }
}

impl AudioSink for RodioSink {
    fn play(
        &mut self,
        audio: Vec<u8>,
        generation: u64,
        done: tokio::sync::mpsc::UnboundedSender<PlaybackEvent>,
    ) -> VoiceResult<()> {
        self.cmd_tx
            .send(SinkCommand::Play {
                audio,
                generation,
                done,
            })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(SinkCommand::Stop);
    }

    fn pause(&mut self) {
        let _ = self.cmd_tx.send(SinkCommand::Pause);
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        let (tx, _rx) = std_mpsc::channel();
        // Replacing the sender closes the channel; the thread exits its loop.
        self.cmd_tx = tx;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn playback_loop(cmd_rx: std_mpsc::Receiver<SinkCommand>, sink: &Sink) {
    while let Ok(cmd) = cmd_rx.recv() {
        let (audio, generation, done) = match cmd {
            SinkCommand::Play {
                audio,
                generation,
                done,
            } => (audio, generation, done),
            // Stop/pause with nothing queued are no-ops.
            SinkCommand::Stop => continue,
            SinkCommand::Pause => {
                sink.pause();
                continue;
            }
        };

        let source = match rodio::Decoder::new(Cursor::new(audio)) {
            Ok(s) => s,
            Err(e) => {
                warn!("playback decode failed: {}", e);
                let _ = done.send(PlaybackEvent::Failed { generation });
                continue;
            }
        };
        sink.play();
        sink.append(source.convert_samples::<f32>());
        debug!("▶️ playback started (generation {})", generation);

        // Watch for stop/pause while draining; exactly one terminal event.
        let terminal = loop {
            match cmd_rx.recv_timeout(POLL) {
                Ok(SinkCommand::Stop) => {
                    sink.stop();
                    info!("⏹️ playback stopped (interruption)");
                    break PlaybackEvent::Stopped { generation };
                }
                Ok(SinkCommand::Pause) => sink.pause(),
                Ok(SinkCommand::Play { done: next_done, generation: next_gen, .. }) => {
                    // The orchestrator never overlaps playback; treat an
                    // unexpected overlap as a failed invocation.
                    warn!("play received while playing, rejecting");
                    let _ = next_done.send(PlaybackEvent::Failed { generation: next_gen });
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    if sink.empty() {
                        break PlaybackEvent::Completed { generation };
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    sink.stop();
                    break PlaybackEvent::Stopped { generation };
                }
            }
        };
        let _ = done.send(terminal);
    }
}
