//! Assistant configuration.
//!
//! Everything here is plain data with serde defaults so the host app can
//! deserialize a partial settings file and fill the rest from `Default`.
//! Durations are stored in seconds and converted to classifier ticks with
//! [`AudioConfig::ticks_for`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::device::DeviceRef;
use crate::error::{HarkError, Result};

/// Capture format and framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Frame sample rate (Hz). Capture at other device rates is resampled.
    pub sample_rate: u32,
    /// Channel count of a Frame. Only mono is supported.
    pub channels: u16,
    /// Samples per Frame. 512 @ 16 kHz = 32 ms.
    pub frame_size: usize,
    /// Bounded frame queue depth between capture and the controller.
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_size: 512,
            queue_capacity: 64,
        }
    }
}

impl AudioConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }

    /// Number of whole frames covering `secs`, never less than one.
    pub fn ticks_for(&self, secs: f32) -> u32 {
        let frame_secs = self.frame_size as f64 / self.sample_rate as f64;
        // f32 seconds are not exact; tolerate the representation error.
        let ticks = (secs.max(0.0) as f64) / frame_secs - 1e-4;
        ticks.ceil().max(1.0) as u32
    }
}

/// Thresholds for the speech/silence classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Absolute RMS floor (i16 scale) a frame must exceed to count as speech.
    pub base_threshold: f32,
    /// Speech must exceed the noise baseline by this factor.
    pub background_noise_multiplier: f32,
    /// Speech-band magnitude must exceed the baseline magnitude by this factor.
    pub magnitude_multiplier: f32,
    /// Minimum signal-to-noise ratio against the baseline, in dB.
    pub min_snr_db: f32,
    pub speech_band_low_hz: f32,
    pub speech_band_high_hz: f32,
    /// Exponential smoothing factor applied to the baseline on silence.
    pub baseline_smoothing: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_threshold: 200.0,
            background_noise_multiplier: 1.5,
            magnitude_multiplier: 1.5,
            min_snr_db: 6.0,
            speech_band_low_hz: 85.0,
            speech_band_high_hz: 3_000.0,
            baseline_smoothing: 0.05,
        }
    }
}

/// Utterance recording limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Trailing silence that ends a response utterance.
    pub response_silence_secs: f32,
    /// Silence tolerated while waiting to be addressed (before first speech).
    pub wake_silence_secs: f32,
    /// Cap on retained trailing silence.
    pub buffer_duration_secs: f32,
    /// Cap on retained leading silence before speech starts.
    pub pre_roll_secs: f32,
    /// Hard limit on one utterance.
    pub max_utterance_secs: f32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            response_silence_secs: 0.7,
            wake_silence_secs: 2.0,
            buffer_duration_secs: 0.5,
            pre_roll_secs: 0.3,
            max_utterance_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeStrategy {
    /// Periodic snippets sent to the transcription collaborator.
    Transcription,
    /// Streaming keyword models scored per frame.
    Acoustic,
}

/// Wake-word gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub strategy: WakeStrategy,
    pub phrases: Vec<String>,
    /// Fire when a phrase appears verbatim in the transcript.
    pub substring_match: bool,
    /// Fire when similarity reaches this ratio. `None` disables fuzzy matching.
    pub similarity_threshold: Option<f32>,
    /// Longest snippet sent for transcription.
    pub window_secs: f32,
    /// Shorter snippets are discarded without a transcription call.
    pub min_snippet_secs: f32,
    /// Trailing silence that closes a snippet and sends it for transcription.
    pub snippet_silence_secs: f32,
    /// Score an acoustic keyword model must reach.
    pub acoustic_threshold: f32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            strategy: WakeStrategy::Transcription,
            phrases: vec![
                "hey chat".into(),
                "hi chat".into(),
                "hello chat".into(),
                "hey chatbot".into(),
                "ok chat".into(),
            ],
            substring_match: true,
            similarity_threshold: Some(0.85),
            window_secs: 3.0,
            min_snippet_secs: 0.3,
            snippet_silence_secs: 0.6,
            acoustic_threshold: 0.5,
        }
    }
}

/// Conversation and collaborator policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Follow-up window after a reply before returning to wake-word listening.
    pub cooldown_secs: f32,
    /// Deadline for each collaborator call.
    pub collaborator_timeout_secs: f32,
    pub max_tool_rounds: usize,
    /// Non-system messages kept in history.
    pub max_history_messages: usize,
    pub system_prompt: String,
    pub voice: String,
    pub language: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 10.0,
            collaborator_timeout_secs: 30.0,
            max_tool_rounds: 4,
            max_history_messages: 40,
            system_prompt: "You are a voice assistant. Today is {current_date} and the time is \
                            {current_time}. Answer briefly and clearly; your reply will be spoken aloud."
                .into(),
            voice: "nova".into(),
            language: Some("en".into()),
        }
    }
}

impl SessionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f32(self.cooldown_secs.max(0.0))
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.collaborator_timeout_secs.max(0.1))
    }
}

/// Resolved device candidates, in preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub input_candidates: Vec<DeviceRef>,
    pub output_candidates: Vec<DeviceRef>,
    /// Total capture open attempts across the candidate list.
    pub capture_attempts: u32,
    /// Total playback attempts across the candidate list.
    pub playback_attempts: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            input_candidates: vec![DeviceRef::Default],
            output_candidates: vec![DeviceRef::Default],
            capture_attempts: 3,
            playback_attempts: 2,
        }
    }
}

/// Optional cue sounds (WAV files).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CueSounds {
    pub activation: Option<PathBuf>,
    pub ready: Option<PathBuf>,
    pub sleep: Option<PathBuf>,
    pub error: Option<PathBuf>,
}

/// Full configuration snapshot held by the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub audio: AudioConfig,
    pub classifier: ClassifierConfig,
    pub recorder: RecorderConfig,
    pub wake: WakeConfig,
    pub session: SessionConfig,
    pub devices: DeviceConfig,
    pub cues: CueSounds,
}

impl AssistantConfig {
    /// Reject values the classifier and recorder cannot work with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        if a.sample_rate == 0 || a.frame_size == 0 || a.queue_capacity == 0 {
            return Err(HarkError::Config(
                "sample_rate, frame_size and queue_capacity must be non-zero".into(),
            ));
        }
        if a.channels != 1 {
            return Err(HarkError::Config(format!(
                "only mono frames are supported, got {} channels",
                a.channels
            )));
        }

        let c = &self.classifier;
        if !(c.base_threshold > 0.0) {
            return Err(HarkError::Config("base_threshold must be > 0".into()));
        }
        if c.background_noise_multiplier < 1.0 || c.magnitude_multiplier < 1.0 {
            return Err(HarkError::Config("multipliers must be >= 1.0".into()));
        }
        if !(c.speech_band_low_hz >= 0.0 && c.speech_band_low_hz < c.speech_band_high_hz) {
            return Err(HarkError::Config(
                "speech band lower bound must be below the upper bound".into(),
            ));
        }
        if c.speech_band_high_hz > a.sample_rate as f32 / 2.0 {
            return Err(HarkError::Config(format!(
                "speech band upper bound {} Hz exceeds Nyquist for {} Hz",
                c.speech_band_high_hz, a.sample_rate
            )));
        }
        if !(c.baseline_smoothing > 0.0 && c.baseline_smoothing <= 1.0) {
            return Err(HarkError::Config(
                "baseline_smoothing must be in (0, 1]".into(),
            ));
        }

        let r = &self.recorder;
        if !(r.response_silence_secs > 0.0 && r.wake_silence_secs > 0.0) {
            return Err(HarkError::Config("silence thresholds must be > 0".into()));
        }
        if !(r.max_utterance_secs > 0.0) {
            return Err(HarkError::Config("max_utterance_secs must be > 0".into()));
        }

        let w = &self.wake;
        if !(w.snippet_silence_secs > 0.0) {
            return Err(HarkError::Config("snippet_silence_secs must be > 0".into()));
        }
        if w.strategy == WakeStrategy::Transcription {
            if w.phrases.iter().all(|p| p.trim().is_empty()) {
                return Err(HarkError::Config("at least one wake phrase is required".into()));
            }
            if !w.substring_match && w.similarity_threshold.is_none() {
                return Err(HarkError::Config(
                    "enable substring matching or set a similarity threshold".into(),
                ));
            }
        }
        if let Some(t) = w.similarity_threshold {
            if !(t > 0.0 && t <= 1.0) {
                return Err(HarkError::Config(
                    "similarity_threshold must be in (0, 1]".into(),
                ));
            }
        }

        let d = &self.devices;
        if d.input_candidates.is_empty() || d.capture_attempts == 0 {
            return Err(HarkError::Config(
                "at least one input candidate and one capture attempt are required".into(),
            ));
        }
        if d.output_candidates.is_empty() || d.playback_attempts == 0 {
            return Err(HarkError::Config(
                "at least one output candidate and one playback attempt are required".into(),
            ));
        }

        Ok(())
    }
}
