//! Utterance recording.
//!
//! ```text
//! Armed ──first frame──► Accumulating ──SilenceRun ≥ threshold──► Finished
//!                              │
//!                              └──audio time > max_duration──► TimedOut
//! ```
//!
//! Before the first speech frame, silence is kept in a short pre-roll and
//! the run is measured against the onset limit (if any). After speech it is
//! measured against the response threshold, and trailing silence is retained
//! up to the buffer-duration cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffering::{frame::encode_wav, Frame, FrameReceiver, FrameRecv};
use crate::classifier::{Classifier, NoiseFloor, Verdict};
use crate::config::{AudioConfig, RecorderConfig};
use crate::error::{HarkError, Result};

/// Consecutive silent ticks. Reset on speech.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SilenceRun(u32);

impl SilenceRun {
    pub fn count(self) -> u32 {
        self.0
    }

    pub fn observe(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Speech => self.0 = 0,
            Verdict::Silence => self.0 = self.0.saturating_add(1),
        }
    }

    pub fn reached(self, threshold: u32) -> bool {
        self.0 >= threshold
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Frame-count limits for one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderLimits {
    /// Leading silence kept before the first speech frame.
    pub pre_roll_frames: usize,
    /// Trailing silence kept after the last speech frame.
    pub trailing_cap_frames: usize,
    /// Silence ticks after speech that end the utterance.
    pub response_ticks: u32,
    /// Silence ticks before any speech that end the recording empty.
    /// `None` waits indefinitely (follow-up mode).
    pub onset_ticks: Option<u32>,
}

impl RecorderLimits {
    pub fn from_config(audio: &AudioConfig, recorder: &RecorderConfig) -> Self {
        let frames = |secs: f32| {
            if secs <= 0.0 {
                0
            } else {
                audio.ticks_for(secs) as usize
            }
        };
        Self {
            pre_roll_frames: frames(recorder.pre_roll_secs),
            trailing_cap_frames: frames(recorder.buffer_duration_secs),
            response_ticks: audio.ticks_for(recorder.response_silence_secs),
            onset_ticks: Some(audio.ticks_for(recorder.wake_silence_secs)),
        }
    }

    /// Same limits without the onset cutoff.
    pub fn follow_up(self) -> Self {
        Self {
            onset_ticks: None,
            ..self
        }
    }
}

/// Audio captured for one user turn.
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<Frame>,
    speech_frames: usize,
}

impl Utterance {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// `true` when no frame was classified as speech.
    pub fn is_empty(&self) -> bool {
        self.speech_frames == 0
    }

    pub fn speech_frames(&self) -> usize {
        self.speech_frames
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(Frame::duration).sum()
    }

    pub fn to_wav(&self, sample_rate: u32) -> Result<Vec<u8>> {
        encode_wav(&self.frames, sample_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Armed,
    Accumulating,
    Finished,
    TimedOut,
}

/// Result of feeding one frame.
#[derive(Debug)]
pub enum RecorderStep {
    Continue,
    /// First speech frame of this recording.
    SpeechStarted,
    Finished(Utterance),
    TimedOut,
}

pub struct UtteranceRecorder {
    limits: RecorderLimits,
    max_duration: Duration,
    state: RecorderState,
    frames: VecDeque<Frame>,
    silence: SilenceRun,
    trailing: usize,
    speech_frames: usize,
    elapsed: Duration,
}

impl UtteranceRecorder {
    pub fn new(limits: RecorderLimits, max_duration: Duration) -> Self {
        Self {
            limits,
            max_duration,
            state: RecorderState::Armed,
            frames: VecDeque::new(),
            silence: SilenceRun::default(),
            trailing: 0,
            speech_frames: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Discard any partial recording and arm with new limits.
    pub fn arm(&mut self, limits: RecorderLimits, max_duration: Duration) {
        *self = Self::new(limits, max_duration);
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn silence_run(&self) -> SilenceRun {
        self.silence
    }

    pub fn limits(&self) -> RecorderLimits {
        self.limits
    }

    /// Feed one classified frame.
    ///
    /// After `Finished` or `TimedOut` further frames are ignored until
    /// [`arm`](Self::arm) is called.
    pub fn push(&mut self, frame: Frame, verdict: Verdict) -> RecorderStep {
        match self.state {
            RecorderState::Finished | RecorderState::TimedOut => return RecorderStep::Continue,
            RecorderState::Armed => self.state = RecorderState::Accumulating,
            RecorderState::Accumulating => {}
        }

        self.elapsed += frame.duration();
        if self.elapsed > self.max_duration {
            debug!(
                elapsed_ms = self.elapsed.as_millis() as u64,
                "recording exceeded max duration"
            );
            self.state = RecorderState::TimedOut;
            self.frames.clear();
            return RecorderStep::TimedOut;
        }

        self.silence.observe(verdict);

        if self.speech_frames == 0 {
            return self.push_before_speech(frame, verdict);
        }

        match verdict {
            Verdict::Speech => {
                self.trailing = 0;
                self.speech_frames += 1;
                self.frames.push_back(frame);
            }
            Verdict::Silence => {
                if self.trailing < self.limits.trailing_cap_frames {
                    self.frames.push_back(frame);
                }
                self.trailing += 1;
            }
        }

        if self.silence.reached(self.limits.response_ticks) {
            return self.finish();
        }
        RecorderStep::Continue
    }

    fn push_before_speech(&mut self, frame: Frame, verdict: Verdict) -> RecorderStep {
        match verdict {
            Verdict::Speech => {
                self.speech_frames = 1;
                self.frames.push_back(frame);
                RecorderStep::SpeechStarted
            }
            Verdict::Silence => {
                if self.limits.pre_roll_frames > 0 {
                    self.frames.push_back(frame);
                    while self.frames.len() > self.limits.pre_roll_frames {
                        self.frames.pop_front();
                    }
                }
                match self.limits.onset_ticks {
                    Some(limit) if self.silence.reached(limit) => self.finish(),
                    _ => RecorderStep::Continue,
                }
            }
        }
    }

    fn finish(&mut self) -> RecorderStep {
        self.state = RecorderState::Finished;
        let frames: Vec<Frame> = self.frames.drain(..).collect();
        RecorderStep::Finished(Utterance {
            frames,
            speech_frames: self.speech_frames,
        })
    }

    /// Blocking form: pull frames from `rx` until the recording ends.
    ///
    /// The recorder classifies with `classifier` and adapts `floor` on
    /// silence. A closed queue is a device fault.
    pub fn record(
        &mut self,
        rx: &FrameReceiver,
        classifier: &Classifier,
        floor: &mut NoiseFloor,
    ) -> Result<Utterance> {
        // Wall-clock guard for a source that stops delivering without closing.
        let stall_limit = self.max_duration * 2 + Duration::from_secs(1);
        let started = Instant::now();
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                FrameRecv::Frame(frame) => {
                    let c = classifier.classify_or_silence(&frame, floor);
                    if !c.is_speech() {
                        floor.adapt(&c);
                    }
                    match self.push(frame, c.verdict) {
                        RecorderStep::Finished(utterance) => return Ok(utterance),
                        RecorderStep::TimedOut => return Err(HarkError::timeout("utterance")),
                        RecorderStep::Continue | RecorderStep::SpeechStarted => {}
                    }
                }
                FrameRecv::Empty => {
                    if started.elapsed() > stall_limit {
                        return Err(HarkError::timeout("utterance"));
                    }
                }
                FrameRecv::Closed => {
                    return Err(HarkError::Device("capture stopped while recording".into()))
                }
            }
        }
    }
}
