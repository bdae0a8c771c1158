//! Speech/silence classification from raw signal statistics.
//!
//! ## Algorithm
//!
//! For each frame:
//!
//! 1. RMS of the i16 samples.
//! 2. Forward FFT; mean bin magnitude inside the speech band and the
//!    dominant frequency there.
//! 3. SNR of the RMS against the noise floor, in dB.
//!
//! A frame is speech only when all three clear their thresholds:
//!
//! ```text
//! rms       > max(base_threshold, floor.rms * background_noise_multiplier)
//! band_mag  > floor.magnitude * magnitude_multiplier
//! snr_db   >= min_snr_db
//! ```
//!
//! The classifier itself is immutable. Adaptation lives in [`NoiseFloor`],
//! which the caller owns and updates on silence only.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::warn;

use crate::buffering::Frame;
use crate::config::ClassifierConfig;
use crate::error::{HarkError, Result};

/// Per-frame verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Speech,
    Silence,
}

impl Verdict {
    pub fn is_speech(self) -> bool {
        self == Verdict::Speech
    }
}

/// Verdict plus the energy metrics it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    /// RMS amplitude on the i16 scale.
    pub rms: f32,
    /// Strongest frequency inside the speech band (Hz), 0 when the band is empty.
    pub dominant_hz: f32,
    /// Mean normalised FFT magnitude inside the speech band.
    pub band_magnitude: f32,
    /// RMS against the noise floor in dB. Infinite on an unadapted floor.
    pub snr_db: f32,
    /// Stand-in for a frame the classifier rejected. Carries no level.
    pub malformed: bool,
}

impl Classification {
    /// Verdict used in place of a malformed frame.
    pub fn silence() -> Self {
        Self {
            verdict: Verdict::Silence,
            rms: 0.0,
            dominant_hz: 0.0,
            band_magnitude: 0.0,
            snr_db: 0.0,
            malformed: true,
        }
    }

    pub fn is_speech(&self) -> bool {
        self.verdict.is_speech()
    }
}

/// Rolling estimate of ambient noise.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseFloor {
    pub rms: f32,
    pub magnitude: f32,
    smoothing: f32,
    observations: u64,
}

impl NoiseFloor {
    /// A floor that has seen no audio yet. Only the absolute threshold applies.
    pub fn new(smoothing: f32) -> Self {
        Self {
            rms: 0.0,
            magnitude: 0.0,
            smoothing: smoothing.clamp(f32::EPSILON, 1.0),
            observations: 0,
        }
    }

    pub fn is_adapted(&self) -> bool {
        self.observations > 0
    }

    /// Fold a silence classification into the floor. Speech and malformed
    /// stand-ins are ignored.
    ///
    /// The first observation seeds the floor directly; later ones are
    /// exponentially smoothed.
    pub fn adapt(&mut self, c: &Classification) {
        if c.is_speech() || c.malformed {
            return;
        }
        if self.observations == 0 {
            self.rms = c.rms;
            self.magnitude = c.band_magnitude;
        } else {
            let a = self.smoothing;
            self.rms += a * (c.rms - self.rms);
            self.magnitude += a * (c.band_magnitude - self.magnitude);
        }
        self.observations += 1;
    }

    pub fn reset(&mut self) {
        self.rms = 0.0;
        self.magnitude = 0.0;
        self.observations = 0;
    }
}

/// Stateless frame classifier. The FFT plan is built once for the frame length.
pub struct Classifier {
    config: ClassifierConfig,
    sample_rate: u32,
    frame_size: usize,
    fft: Arc<dyn Fft<f32>>,
    /// Inclusive FFT bin range covering the speech band.
    band: std::ops::RangeInclusive<usize>,
}

impl Classifier {
    /// # Errors
    /// `HarkError::Config` when thresholds or the speech band are invalid for
    /// this sample rate.
    pub fn new(config: ClassifierConfig, sample_rate: u32, frame_size: usize) -> Result<Self> {
        if sample_rate == 0 || frame_size == 0 {
            return Err(HarkError::Config(
                "classifier needs a non-zero sample rate and frame size".into(),
            ));
        }
        if !(config.base_threshold > 0.0) {
            return Err(HarkError::Config("base_threshold must be > 0".into()));
        }
        if config.background_noise_multiplier < 1.0 || config.magnitude_multiplier < 1.0 {
            return Err(HarkError::Config("multipliers must be >= 1.0".into()));
        }
        let nyquist = sample_rate as f32 / 2.0;
        if !(config.speech_band_low_hz >= 0.0
            && config.speech_band_low_hz < config.speech_band_high_hz
            && config.speech_band_high_hz <= nyquist)
        {
            return Err(HarkError::Config(format!(
                "speech band {}..{} Hz is invalid for {} Hz audio",
                config.speech_band_low_hz, config.speech_band_high_hz, sample_rate
            )));
        }

        let bin_hz = sample_rate as f32 / frame_size as f32;
        let lo = (config.speech_band_low_hz / bin_hz).ceil() as usize;
        let hi = ((config.speech_band_high_hz / bin_hz).floor() as usize).min(frame_size / 2);

        let fft = FftPlanner::<f32>::new().plan_fft_forward(frame_size);

        Ok(Self {
            config,
            sample_rate,
            frame_size,
            fft,
            band: lo..=hi,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one frame against `floor`. Does not touch the floor.
    pub fn classify(&self, frame: &Frame, floor: &NoiseFloor) -> Result<Classification> {
        if frame.is_empty() {
            return Err(HarkError::Classification("empty frame".into()));
        }
        if frame.len() != self.frame_size {
            return Err(HarkError::Classification(format!(
                "expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        if frame.sample_rate != self.sample_rate {
            return Err(HarkError::Classification(format!(
                "expected {} Hz, got {} Hz",
                self.sample_rate, frame.sample_rate
            )));
        }

        let rms = rms_i16(&frame.samples);
        let (band_magnitude, dominant_hz) = self.band_stats(&frame.samples);
        let snr_db = snr_db(rms, floor.rms);

        let c = &self.config;
        let energy_ok = rms > c.base_threshold.max(floor.rms * c.background_noise_multiplier);
        let band_ok = band_magnitude > floor.magnitude * c.magnitude_multiplier;
        let snr_ok = snr_db >= c.min_snr_db;

        let verdict = if energy_ok && band_ok && snr_ok {
            Verdict::Speech
        } else {
            Verdict::Silence
        };

        Ok(Classification {
            verdict,
            rms,
            dominant_hz,
            band_magnitude,
            snr_db,
            malformed: false,
        })
    }

    /// Like [`classify`](Self::classify), but a malformed frame is logged
    /// and treated as silence.
    pub fn classify_or_silence(&self, frame: &Frame, floor: &NoiseFloor) -> Classification {
        match self.classify(frame, floor) {
            Ok(c) => c,
            Err(e) => {
                warn!(seq = frame.seq, "classifier rejected frame: {e}");
                Classification::silence()
            }
        }
    }

    fn band_stats(&self, samples: &[i16]) -> (f32, f32) {
        if self.band.is_empty() {
            return (0.0, 0.0);
        }

        let mut buf: Vec<Complex<f32>> = samples
            .iter()
            .map(|&s| Complex::new(s as f32, 0.0))
            .collect();
        self.fft.process(&mut buf);

        let n = self.frame_size as f32;
        let bin_hz = self.sample_rate as f32 / n;
        let mut sum = 0.0f32;
        let mut peak = (0.0f32, *self.band.start());
        for k in self.band.clone() {
            let mag = buf[k].norm() / n;
            sum += mag;
            if mag > peak.0 {
                peak = (mag, k);
            }
        }
        let count = self.band.clone().count() as f32;
        (sum / count, peak.1 as f32 * bin_hz)
    }
}

pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

fn snr_db(rms: f32, floor_rms: f32) -> f32 {
    if floor_rms <= f32::EPSILON {
        return if rms > 0.0 { f32::INFINITY } else { 0.0 };
    }
    if rms <= f32::EPSILON {
        return f32::NEG_INFINITY;
    }
    20.0 * (rms / floor_rms).log10()
}
