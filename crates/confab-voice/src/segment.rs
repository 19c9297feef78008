//! Utterance segmentation: turning a stream of VAD decisions into turns.
//!
//! The segmenter buffers every frame of the open utterance and finalizes it
//! when enough trailing silence follows real speech, or when the hard
//! duration cap fires. All timing comes from caller-supplied `Instant`s, so
//! the whole state machine is testable without sleeping.
//!
//! If VAD construction failed, the session degrades to a pure-timeout
//! segmenter: finalize unconditionally after a fixed duration instead of
//! failing outright.

use crate::vad::VadDecision;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timing policy for utterance boundaries.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Shortest accepted utterance (default 500ms).
    pub min_utterance: Duration,

    /// Trailing silence that ends an utterance (default 800ms).
    pub silence_timeout: Duration,

    /// Hard cap regardless of continued speech (default 20s).
    pub max_utterance: Duration,

    /// Finalize interval in degraded (no-VAD) mode (default 5s).
    pub degraded_timeout: Duration,

    /// Sample rate stamped onto finalized utterances (default 16000).
    pub sample_rate: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_utterance: Duration::from_millis(500),
            silence_timeout: Duration::from_millis(800),
            max_utterance: Duration::from_secs(20),
            degraded_timeout: Duration::from_secs(5),
            sample_rate: 16000,
        }
    }
}

/// A finalized span of user speech, ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// PCM samples (f32, -1.0..1.0) from first frame to finalize.
    pub samples: Vec<f32>,
    /// Sample rate of `samples`.
    pub sample_rate: u32,
    /// Wall-clock time the utterance was finalized.
    pub timestamp: DateTime<Utc>,
    /// Elapsed time from first frame to finalize.
    pub duration: Duration,
}

/// State machine over VAD decisions. Exactly one utterance is open at a time;
/// `poll` finalizes at most once per utterance and resets for the next.
pub struct UtteranceSegmenter {
    config: SegmenterConfig,
    degraded: bool,

    started_at: Option<Instant>,
    last_speech: Option<Instant>,
    has_speech: bool,
    buffer: Vec<f32>,
}

impl UtteranceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            degraded: false,
            started_at: None,
            last_speech: None,
            has_speech: false,
            buffer: Vec::new(),
        }
    }

    /// Pure-timeout mode, used when VAD construction failed.
    pub fn degraded(config: SegmenterConfig) -> Self {
        warn!(
            "segmenter degraded to pure-timeout mode ({}ms per utterance)",
            config.degraded_timeout.as_millis()
        );
        let mut s = Self::new(config);
        s.degraded = true;
        s
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Feed one classified frame into the open utterance.
    pub fn observe(&mut self, decision: &VadDecision, samples: &[f32]) {
        if self.started_at.is_none() {
            self.started_at = Some(decision.timestamp);
        }
        self.buffer.extend_from_slice(samples);
        if decision.is_speech {
            if !self.has_speech {
                info!("🎤 speech started (energy {:.3})", decision.energy);
            }
            self.has_speech = true;
            self.last_speech = Some(decision.timestamp);
        }
    }

    /// Feed an unclassified frame (degraded mode).
    pub fn observe_raw(&mut self, timestamp: Instant, samples: &[f32]) {
        if self.started_at.is_none() {
            self.started_at = Some(timestamp);
        }
        self.buffer.extend_from_slice(samples);
    }

    /// Evaluate the finalize conditions. Callers invoke this on the polling
    /// tick, and only while the session is listening — playback phases never
    /// poll, so the assistant cannot segment its own voice.
    pub fn poll(&mut self, now: Instant) -> Option<Utterance> {
        let started = self.started_at?;
        let elapsed = now.saturating_duration_since(started);

        if self.degraded {
            if elapsed >= self.config.degraded_timeout {
                return Some(self.finalize(now, elapsed));
            }
            return None;
        }

        if !self.has_speech {
            // Pure room noise: drop the buffer at the cap to bound memory.
            if elapsed >= self.config.max_utterance {
                debug!("no speech within {}s, discarding buffer", elapsed.as_secs());
                self.reset();
            }
            return None;
        }

        if elapsed < self.config.min_utterance {
            return None;
        }

        let silence = self
            .last_speech
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();

        if silence >= self.config.silence_timeout {
            debug!("trailing silence reached ({}ms)", silence.as_millis());
            return Some(self.finalize(now, elapsed));
        }
        if elapsed >= self.config.max_utterance {
            warn!("⏱️ max utterance duration reached, forcing finalize");
            return Some(self.finalize(now, elapsed));
        }
        None
    }

    fn finalize(&mut self, _now: Instant, elapsed: Duration) -> Utterance {
        let samples = std::mem::take(&mut self.buffer);
        info!(
            "✅ utterance finalized ({:.1}s, {} samples)",
            elapsed.as_secs_f32(),
            samples.len()
        );
        let utterance = Utterance {
            samples,
            sample_rate: self.config.sample_rate,
            timestamp: Utc::now(),
            duration: elapsed,
        };
        self.reset();
        utterance
    }

    /// Clear all state for the next utterance.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.last_speech = None;
        self.has_speech = false;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::{EnergyVad, VadConfig};
    use crate::audio::AudioFrame;

    const FRAME: Duration = Duration::from_millis(50);

    fn decision(t: Instant, is_speech: bool) -> VadDecision {
        VadDecision {
            timestamp: t,
            is_speech,
            energy: if is_speech { 0.10 } else { 0.01 },
        }
    }

    /// Drive `frames` 50ms apart starting at `t0`, polling after each frame.
    fn drive(
        seg: &mut UtteranceSegmenter,
        t0: Instant,
        frames: &[bool],
    ) -> (Vec<Utterance>, Instant) {
        let mut out = Vec::new();
        let mut now = t0;
        for (i, &is_speech) in frames.iter().enumerate() {
            now = t0 + FRAME * i as u32;
            seg.observe(&decision(now, is_speech), &[0.1; 800]);
            if let Some(u) = seg.poll(now) {
                out.push(u);
            }
        }
        (out, now)
    }

    #[test]
    fn speech_then_silence_finalizes_exactly_once() {
        let mut seg = UtteranceSegmenter::new(SegmenterConfig::default());
        let t0 = Instant::now();

        // 1s of speech, then 1s of silence (20 frames each at 50ms).
        let mut frames = vec![true; 20];
        frames.extend(vec![false; 20]);
        let (utterances, end) = drive(&mut seg, t0, &frames);

        assert_eq!(utterances.len(), 1);
        // Finalize fires at last-speech + 800ms, i.e. ~1.75s after start.
        let u = &utterances[0];
        assert!(u.duration >= Duration::from_millis(1700));
        assert!(u.duration <= Duration::from_millis(1900));
        assert!(!u.samples.is_empty());

        // Nothing further without new frames.
        assert!(seg.poll(end + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn sub_threshold_noise_never_finalizes() {
        let mut seg = UtteranceSegmenter::new(SegmenterConfig::default());
        let t0 = Instant::now();
        let frames = vec![false; 100]; // 5s of room noise
        let (utterances, _) = drive(&mut seg, t0, &frames);
        assert!(utterances.is_empty());
    }

    #[test]
    fn max_duration_caps_continuous_speech() {
        let config = SegmenterConfig {
            max_utterance: Duration::from_secs(2),
            ..Default::default()
        };
        let mut seg = UtteranceSegmenter::new(config);
        let t0 = Instant::now();
        let frames = vec![true; 60]; // 3s of non-stop speech
        let (utterances, _) = drive(&mut seg, t0, &frames);
        assert_eq!(utterances.len(), 1);
        assert!(utterances[0].duration >= Duration::from_secs(2));
        assert!(utterances[0].duration < Duration::from_millis(2200));
    }

    #[test]
    fn too_short_speech_waits_for_min_duration() {
        let mut seg = UtteranceSegmenter::new(SegmenterConfig::default());
        let t0 = Instant::now();
        // One 50ms speech frame, then polled well before min_utterance.
        seg.observe(&decision(t0, true), &[0.1; 800]);
        assert!(seg.poll(t0 + Duration::from_millis(100)).is_none());
        // After min duration + silence timeout it does finalize.
        assert!(seg.poll(t0 + Duration::from_millis(900)).is_some());
    }

    #[test]
    fn three_seconds_speech_one_second_silence_yields_3_8s_utterance() {
        // 3s at RMS 0.10, 1s at RMS 0.01: classified through a real detector.
        let vad = EnergyVad::new(VadConfig::default()).unwrap();
        let mut seg = UtteranceSegmenter::new(SegmenterConfig::default());
        let t0 = Instant::now();
        let mut utterances = Vec::new();

        for i in 0..80 {
            let now = t0 + FRAME * i;
            let amplitude = if i < 60 { 0.10 } else { 0.01 };
            let frame = AudioFrame {
                samples: vec![amplitude; 800],
                timestamp: now,
            };
            let d = vad.classify(&frame);
            seg.observe(&d, &frame.samples);
            if let Some(u) = seg.poll(now) {
                utterances.push(u);
            }
        }

        assert_eq!(utterances.len(), 1);
        let secs = utterances[0].duration.as_secs_f32();
        assert!((secs - 3.8).abs() < 0.15, "got {:.2}s", secs);
    }

    #[test]
    fn degraded_mode_finalizes_on_timeout_alone() {
        let mut seg = UtteranceSegmenter::degraded(SegmenterConfig::default());
        assert!(seg.is_degraded());
        let t0 = Instant::now();

        // No VAD decisions at all, just raw frames.
        for i in 0..10 {
            seg.observe_raw(t0 + FRAME * i, &[0.0; 800]);
        }
        assert!(seg.poll(t0 + Duration::from_secs(4)).is_none());
        let u = seg.poll(t0 + Duration::from_secs(5));
        assert!(u.is_some());
        assert_eq!(u.map(|u| u.samples.len()), Some(8000));
    }

    #[test]
    fn reset_discards_open_utterance() {
        let mut seg = UtteranceSegmenter::new(SegmenterConfig::default());
        let t0 = Instant::now();
        seg.observe(&decision(t0, true), &[0.1; 800]);
        seg.reset();
        assert!(seg.poll(t0 + Duration::from_secs(10)).is_none());
    }
}
