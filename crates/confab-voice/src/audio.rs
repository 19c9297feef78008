//! Microphone capture behind the `AudioSource` seam.
//!
//! `CpalSource` owns the hardware: the `cpal::Stream` is `!Send`, so a
//! dedicated thread builds it, keeps it alive, and forwards fixed-size frames
//! over a channel. Hold is a pause flag checked in the input callback — the
//! device stays acquired so resume is instant. Closing (or dropping) the
//! source joins the thread, which releases the device on every exit path.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Analysis frame size in samples (default: 1024)
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 1024,
        }
    }
}

/// A fixed-size block of normalized samples with its capture time.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples in -1.0..1.0.
    pub samples: Vec<f32>,

    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

/// Capability seam for microphone input. The orchestrator drains frames on
/// its polling tick and never touches the device directly.
pub trait AudioSource: Send {
    /// Acquire the device and start delivering frames. Fails with
    /// `AudioDevice`/`AudioStream` when no input exists or the stream cannot
    /// be built; the orchestrator treats that as fatal.
    fn open(&mut self) -> VoiceResult<()>;

    /// Release the device. Safe to call on a source that never opened.
    fn close(&mut self);

    /// Suspend frame delivery without releasing the device (hold).
    fn pause(&mut self);

    /// Resume frame delivery after `pause`.
    fn resume(&mut self);

    /// Non-blocking: the next captured frame, if one is queued.
    fn try_next(&mut self) -> Option<AudioFrame>;
}

struct CaptureState {
    frame_rx: mpsc::UnboundedReceiver<AudioFrame>,
    paused: Arc<AtomicBool>,
    shutdown_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// Microphone capture via CPAL.
pub struct CpalSource {
    config: AudioConfig,
    state: Option<CaptureState>,
}

impl CpalSource {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }
}

impl AudioSource for CpalSource {
    fn open(&mut self) -> VoiceResult<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let paused = Arc::new(AtomicBool::new(false));
        let paused_flag = Arc::clone(&paused);

        let thread = std::thread::spawn(move || {
            let stream = match build_capture_stream(&config, frame_tx, paused_flag) {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Keep the stream alive until close() drops the shutdown sender.
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "🎤 capture open ({}Hz, {}ch, {} samples/frame)",
                    self.config.sample_rate, self.config.channels, self.config.frame_size
                );
                self.state = Some(CaptureState {
                    frame_rx,
                    paused,
                    shutdown_tx,
                    thread: Some(thread),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::AudioDevice(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut state) = self.state.take() {
            drop(state.shutdown_tx);
            if let Some(thread) = state.thread.take() {
                let _ = thread.join();
            }
            info!("🎤 capture closed, device released");
        }
    }

    fn pause(&mut self) {
        if let Some(ref state) = self.state {
            state.paused.store(true, Ordering::Relaxed);
        }
    }

    fn resume(&mut self) {
        if let Some(ref mut state) = self.state {
            state.paused.store(false, Ordering::Relaxed);
            // Frames queued while paused are stale; drop them.
            while state.frame_rx.try_recv().is_ok() {}
        }
    }

    fn try_next(&mut self) -> Option<AudioFrame> {
        self.state.as_mut()?.frame_rx.try_recv().ok()
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_capture_stream(
    config: &AudioConfig,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    paused: Arc<AtomicBool>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    let default_config = device.default_input_config()?;
    info!(
        "📱 input device: {} (native: {}Hz, {}ch)",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        default_config.sample_rate().0,
        default_config.channels()
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_size = config.frame_size;
    let mut sample_buffer: Vec<f32> = Vec::with_capacity(frame_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if paused.load(Ordering::Relaxed) {
                sample_buffer.clear();
                return;
            }
            for &sample in data {
                sample_buffer.push(sample);
                if sample_buffer.len() >= frame_size {
                    let frame = AudioFrame {
                        samples: std::mem::take(&mut sample_buffer),
                        timestamp: Instant::now(),
                    };
                    if frame_tx.send(frame).is_err() {
                        return;
                    }
                    sample_buffer.reserve(frame_size);
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes, for API upload or local playback.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2; // 16-bit samples
    let mut buf = Vec::with_capacity(44 + data_len);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk: PCM, mono, 16 bits
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_size, 1024);
    }

    #[test]
    fn wav_header_is_well_formed() {
        let wav = pcm_f32_to_wav(&[0.0, 0.5, -0.5, 1.0], 16000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        // 4 samples at 16 bits
        assert_eq!(wav.len(), 44 + 8);
        let data_len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(data_len, 8);
    }

    #[test]
    fn wav_clamps_out_of_range_samples() {
        let wav = pcm_f32_to_wav(&[2.0, -2.0], 16000);
        let first = i16::from_le_bytes([wav[44], wav[45]]);
        let second = i16::from_le_bytes([wav[46], wav[47]]);
        assert_eq!(first, 32767);
        assert_eq!(second, -32767);
    }

    #[test]
    fn close_without_open_is_a_noop() {
        let mut source = CpalSource::new(AudioConfig::default());
        source.close();
        assert!(source.try_next().is_none());
    }
}
