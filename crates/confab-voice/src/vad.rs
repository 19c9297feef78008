//! Voice activity detection by short-time RMS energy.
//!
//! Stateless per-frame classification: a frame is speech when the RMS of its
//! normalized samples exceeds the threshold. No smoothing beyond the frame
//! size itself; the segmenter supplies all temporal logic.

use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use std::time::Instant;
use tracing::info;

/// Configuration for energy-based detection.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS above this is speech (default 0.04).
    pub speech_threshold: f32,

    /// Expected analysis window in samples (default 1024). Frames of other
    /// sizes are still classified; the window only documents the intended
    /// time resolution and is validated for sanity.
    pub window_samples: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.04,
            window_samples: 1024,
        }
    }
}

/// Per-frame classification result.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    /// Capture time of the classified frame.
    pub timestamp: Instant,
    /// Whether the frame's energy crossed the speech threshold.
    pub is_speech: bool,
    /// The measured RMS energy.
    pub energy: f32,
}

/// RMS-energy voice activity detector.
pub struct EnergyVad {
    config: VadConfig,
}

impl EnergyVad {
    /// Create a detector. Fails on nonsense configuration so the caller can
    /// degrade to timeout-only segmentation instead of aborting the session.
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        if !(config.speech_threshold > 0.0 && config.speech_threshold < 1.0) {
            return Err(VoiceError::VadInit(format!(
                "speech threshold must be in (0, 1), got {}",
                config.speech_threshold
            )));
        }
        if config.window_samples == 0 {
            return Err(VoiceError::VadInit(
                "analysis window must be at least one sample".to_string(),
            ));
        }
        info!(
            "🎙️ energy VAD ready (threshold {}, window {} samples)",
            config.speech_threshold, config.window_samples
        );
        Ok(Self { config })
    }

    /// Classify one frame.
    pub fn classify(&self, frame: &AudioFrame) -> VadDecision {
        let energy = rms(&frame.samples);
        VadDecision {
            timestamp: frame.timestamp,
            is_speech: energy > self.config.speech_threshold,
            energy,
        }
    }

    pub fn speech_threshold(&self) -> f32 {
        self.config.speech_threshold
    }
}

/// Root-mean-square of normalized samples (-1.0..1.0). Empty input is 0.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// RMS for 8-bit unsigned PCM. The encoding centers silence at 128, so each
/// byte must be re-centered as (b - 128) / 128 before squaring; skipping the
/// center bias makes every frame read as full-scale energy.
pub fn rms_unsigned_u8(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = bytes
        .iter()
        .map(|&b| {
            let centered = (b as f32 - 128.0) / 128.0;
            centered * centered
        })
        .sum();
    (sum_squares / bytes.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            samples,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn silence_is_zero_energy() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&vec![0.0; 1024]), 0.0);
    }

    #[test]
    fn constant_amplitude_rms_matches_amplitude() {
        let r = rms(&vec![0.5; 1024]);
        assert!((r - 0.5).abs() < 1e-6);
    }

    #[test]
    fn default_threshold_separates_speech_from_room_noise() {
        let vad = EnergyVad::new(VadConfig::default()).unwrap();
        let loud = vad.classify(&frame(vec![0.10; 1024]));
        let quiet = vad.classify(&frame(vec![0.01; 1024]));
        assert!(loud.is_speech);
        assert!((loud.energy - 0.10).abs() < 1e-6);
        assert!(!quiet.is_speech);
    }

    #[test]
    fn unsigned_bytes_are_center_biased() {
        // 128 is silence for u8 PCM; without the bias this would read as ~1.0.
        assert_eq!(rms_unsigned_u8(&[128; 1024]), 0.0);
        let r = rms_unsigned_u8(&[192; 1024]); // (192-128)/128 = 0.5
        assert!((r - 0.5).abs() < 1e-6);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad_threshold = VadConfig {
            speech_threshold: 0.0,
            ..Default::default()
        };
        assert!(EnergyVad::new(bad_threshold).is_err());

        let bad_window = VadConfig {
            window_samples: 0,
            ..Default::default()
        };
        assert!(EnergyVad::new(bad_window).is_err());
    }
}
