//! Wake-word gating.
//!
//! Two strategies share [`WakeWordGate`]:
//!
//! - [`TranscriptionGate`] segments speech into short snippets, transcribes
//!   them on a worker thread and matches the text against the phrase set.
//! - [`AcousticGate`] scores every frame with streaming keyword models.
//!
//! Gates never block the controller. Transcription results are polled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, info, warn};

use crate::buffering::{frame::encode_wav, Frame};
use crate::classifier::Verdict;
use crate::collaborators::Transcriber;
use crate::config::AssistantConfig;
use crate::error::{HarkError, Result};
use crate::recorder::SilenceRun;

/// Raised when a wake phrase is detected.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    /// The configured phrase (or keyword model name) that matched.
    pub phrase: String,
    /// Normalised transcript, when the trigger came from transcription.
    pub transcript: Option<String>,
    /// Similarity ratio or model score.
    pub score: f32,
}

pub trait WakeWordGate: Send {
    /// Feed one frame with its classifier verdict.
    fn feed(&mut self, frame: &Frame, verdict: Verdict) -> Option<TriggerEvent>;

    /// Check for a result without new audio.
    fn poll(&mut self) -> Option<TriggerEvent> {
        None
    }

    /// Drop buffered audio and any pending work.
    fn reset(&mut self);
}

// ── Phrase matching ─────────────────────────────────────────────────────────

/// Lower-case, strip `,.!?` and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | '!' | '?'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ratcliff/Obershelp similarity: `2 * matched / (len(a) + len(b))`.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f32 / total as f32
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, k) = longest_common_block(a, b);
    if k == 0 {
        return 0;
    }
    k + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + k..], &b[j + k..])
}

/// Longest common contiguous block, earliest in `a` then earliest in `b`.
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        for j in 0..b.len() {
            cur[j + 1] = if a[i] == b[j] { prev[j] + 1 } else { 0 };
            let k = cur[j + 1];
            if k > best.2 {
                best = (i + 1 - k, j + 1 - k, k);
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Substring,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhraseMatch {
    pub phrase: String,
    pub kind: MatchKind,
    pub score: f32,
}

/// Matches transcripts against normalised wake phrases.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    phrases: Vec<String>,
    substring: bool,
    threshold: Option<f32>,
}

impl PhraseMatcher {
    pub fn new(phrases: &[String], substring: bool, threshold: Option<f32>) -> Self {
        let mut normalized: Vec<String> = phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        normalized.dedup();
        Self {
            phrases: normalized,
            substring,
            threshold,
        }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// First substring hit, otherwise the best fuzzy hit at or above threshold.
    pub fn find(&self, transcript: &str) -> Option<PhraseMatch> {
        let text = normalize(transcript);
        if text.is_empty() {
            return None;
        }

        if self.substring {
            if let Some(phrase) = self.phrases.iter().find(|p| text.contains(p.as_str())) {
                return Some(PhraseMatch {
                    phrase: phrase.clone(),
                    kind: MatchKind::Substring,
                    score: 1.0,
                });
            }
        }

        let threshold = self.threshold?;
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut best: Option<PhraseMatch> = None;
        for phrase in &self.phrases {
            let score = best_window_similarity(&text, &words, phrase);
            if score >= threshold && best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(PhraseMatch {
                    phrase: phrase.clone(),
                    kind: MatchKind::Fuzzy,
                    score,
                });
            }
        }
        best
    }
}

/// Similarity of `phrase` against the whole text and every word window of
/// the phrase's length.
fn best_window_similarity(text: &str, words: &[&str], phrase: &str) -> f32 {
    let mut best = similarity(text, phrase);
    let n = phrase.split_whitespace().count();
    if n > 0 && words.len() > n {
        for window in words.windows(n) {
            best = best.max(similarity(&window.join(" "), phrase));
        }
    }
    best
}

// ── Transcription gate ──────────────────────────────────────────────────────

/// Snippet segmentation limits, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnippetLimits {
    /// Leading silence kept before speech onset.
    pub pre_roll_frames: usize,
    /// Longest snippet.
    pub window_frames: usize,
    /// Snippets with fewer speech frames are discarded.
    pub min_speech_frames: usize,
    /// Silence ticks that close a snippet.
    pub end_silence_ticks: u32,
}

impl SnippetLimits {
    pub fn from_config(cfg: &AssistantConfig) -> Self {
        let audio = &cfg.audio;
        Self {
            pre_roll_frames: audio.ticks_for(cfg.recorder.pre_roll_secs) as usize,
            window_frames: audio.ticks_for(cfg.wake.window_secs) as usize,
            min_speech_frames: audio.ticks_for(cfg.wake.min_snippet_secs) as usize,
            end_silence_ticks: audio.ticks_for(cfg.wake.snippet_silence_secs),
        }
    }
}

struct InFlight {
    rx: Receiver<Result<String>>,
    submitted: Instant,
}

pub struct TranscriptionGate {
    matcher: PhraseMatcher,
    transcriber: Arc<dyn Transcriber>,
    language: Option<String>,
    sample_rate: u32,
    limits: SnippetLimits,
    deadline: Duration,
    buffer: VecDeque<Frame>,
    collecting: bool,
    speech_frames: usize,
    silence: SilenceRun,
    in_flight: Option<InFlight>,
    failures: usize,
}

impl TranscriptionGate {
    pub fn new(
        matcher: PhraseMatcher,
        transcriber: Arc<dyn Transcriber>,
        limits: SnippetLimits,
        sample_rate: u32,
        language: Option<String>,
        deadline: Duration,
    ) -> Self {
        info!(phrases = ?matcher.phrases(), "transcription wake gate ready");
        Self {
            matcher,
            transcriber,
            language,
            sample_rate,
            limits,
            deadline,
            buffer: VecDeque::new(),
            collecting: false,
            speech_frames: 0,
            silence: SilenceRun::default(),
            in_flight: None,
            failures: 0,
        }
    }

    pub fn from_config(cfg: &AssistantConfig, transcriber: Arc<dyn Transcriber>) -> Self {
        let matcher = PhraseMatcher::new(
            &cfg.wake.phrases,
            cfg.wake.substring_match,
            cfg.wake.similarity_threshold,
        );
        Self::new(
            matcher,
            transcriber,
            SnippetLimits::from_config(cfg),
            cfg.audio.sample_rate,
            cfg.session.language.clone(),
            cfg.session.collaborator_timeout(),
        )
    }

    /// Transcription calls that failed or missed the deadline.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn flush(&mut self) {
        let frames: Vec<Frame> = self.buffer.drain(..).collect();
        let speech_frames = self.speech_frames;
        self.collecting = false;
        self.speech_frames = 0;
        self.silence.reset();

        if speech_frames < self.limits.min_speech_frames {
            debug!(speech_frames, "wake snippet too short, discarded");
            return;
        }
        if self.in_flight.is_some() {
            debug!("wake transcription in flight, snippet discarded");
            return;
        }

        let wav = match encode_wav(&frames, self.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                warn!("failed to encode wake snippet: {e}");
                return;
            }
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let transcriber = Arc::clone(&self.transcriber);
        let language = self.language.clone();
        let spawned = thread::Builder::new()
            .name("hark-wake-stt".into())
            .spawn(move || {
                let _ = tx.send(transcriber.transcribe(&wav, language.as_deref()));
            });
        match spawned {
            Ok(_) => {
                debug!(frames = frames.len(), "wake snippet submitted");
                self.in_flight = Some(InFlight {
                    rx,
                    submitted: Instant::now(),
                });
            }
            Err(e) => warn!("failed to spawn wake transcription worker: {e}"),
        }
    }

    fn check_in_flight(&mut self) -> Option<TriggerEvent> {
        let pending = self.in_flight.as_ref()?;
        let result = match pending.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => {
                if pending.submitted.elapsed() > self.deadline {
                    warn!("wake transcription missed its deadline, abandoned");
                    self.failures += 1;
                    self.in_flight = None;
                }
                return None;
            }
            Err(TryRecvError::Disconnected) => Err(HarkError::Other(anyhow::anyhow!(
                "wake transcription worker exited"
            ))),
        };
        self.in_flight = None;

        match result {
            Ok(text) => {
                let found = self.matcher.find(&text);
                debug!(transcript = %text, matched = found.is_some(), "wake snippet transcribed");
                found.map(|m| TriggerEvent {
                    phrase: m.phrase,
                    transcript: Some(normalize(&text)),
                    score: m.score,
                })
            }
            Err(e) => {
                warn!("wake transcription failed: {e}");
                self.failures += 1;
                None
            }
        }
    }
}

impl WakeWordGate for TranscriptionGate {
    fn feed(&mut self, frame: &Frame, verdict: Verdict) -> Option<TriggerEvent> {
        if let Some(trigger) = self.check_in_flight() {
            return Some(trigger);
        }

        if !self.collecting {
            match verdict {
                Verdict::Silence => {
                    if self.limits.pre_roll_frames > 0 {
                        self.buffer.push_back(frame.clone());
                        while self.buffer.len() > self.limits.pre_roll_frames {
                            self.buffer.pop_front();
                        }
                    }
                    return None;
                }
                Verdict::Speech => {
                    self.collecting = true;
                    self.silence.reset();
                }
            }
        }

        self.buffer.push_back(frame.clone());
        self.silence.observe(verdict);
        if verdict.is_speech() {
            self.speech_frames += 1;
        }

        if self.silence.reached(self.limits.end_silence_ticks)
            || self.buffer.len() >= self.limits.window_frames
        {
            self.flush();
        }
        None
    }

    fn poll(&mut self) -> Option<TriggerEvent> {
        self.check_in_flight()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.collecting = false;
        self.speech_frames = 0;
        self.silence.reset();
        self.in_flight = None;
    }
}

// ── Acoustic gate ───────────────────────────────────────────────────────────

/// A streaming keyword spotter. Scores are in [0, 1].
pub trait KeywordModel: Send {
    fn name(&self) -> &str;
    fn predict(&mut self, samples: &[i16]) -> Result<f32>;
    fn reset(&mut self);
}

pub struct AcousticGate {
    models: Vec<Box<dyn KeywordModel>>,
    threshold: f32,
}

impl AcousticGate {
    /// Models are loaded by the caller once, before the gate is built.
    pub fn new(models: Vec<Box<dyn KeywordModel>>, threshold: f32) -> Result<Self> {
        if models.is_empty() {
            return Err(HarkError::Config(
                "acoustic wake gate needs at least one keyword model".into(),
            ));
        }
        info!(
            models = ?models.iter().map(|m| m.name().to_string()).collect::<Vec<_>>(),
            threshold,
            "acoustic wake gate ready"
        );
        Ok(Self { models, threshold })
    }
}

impl WakeWordGate for AcousticGate {
    fn feed(&mut self, frame: &Frame, _verdict: Verdict) -> Option<TriggerEvent> {
        let mut hit = None;
        for model in &mut self.models {
            match model.predict(&frame.samples) {
                Ok(score) if score >= self.threshold => {
                    hit = Some(TriggerEvent {
                        phrase: model.name().to_string(),
                        transcript: None,
                        score,
                    });
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(model = model.name(), "keyword model failed: {e}"),
            }
        }
        if hit.is_some() {
            self.reset();
        }
        hit
    }

    fn reset(&mut self) {
        for model in &mut self.models {
            model.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn similarity_matches_sequence_ratio() {
        assert_relative_eq!(similarity("hey chats", "hey chat"), 16.0 / 17.0);
        assert_relative_eq!(similarity("abcd", "bcde"), 0.75);
        assert_relative_eq!(similarity("", ""), 1.0);
        assert_relative_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("  Hey,   Chat!  "), "hey chat");
        assert_eq!(normalize("OK. Chat?"), "ok chat");
    }

    #[test]
    fn substring_gate_finds_phrase_inside_sentence() {
        let m = PhraseMatcher::new(&["Hey Chat".to_string()], true, None);
        let hit = m.find("Um, hey chat, what's the weather?").expect("match");
        assert_eq!(hit.kind, MatchKind::Substring);
        assert_eq!(hit.phrase, "hey chat");
        assert!(m.find("hello there").is_none());
    }

    #[test]
    fn fuzzy_gate_uses_word_windows() {
        let m = PhraseMatcher::new(&["hey chat".to_string()], false, Some(0.8));
        let hit = m
            .find("so anyway hay chat can you help")
            .expect("window match");
        assert_eq!(hit.kind, MatchKind::Fuzzy);
        assert!(hit.score >= 0.8);
        assert!(m.find("what a nice day").is_none());
    }

    #[test]
    fn disabled_gates_never_match() {
        let m = PhraseMatcher::new(&["hey chat".to_string()], false, None);
        assert!(m.find("hey chat").is_none());
    }

    struct ThresholdModel {
        name: String,
        scores: Vec<f32>,
        resets: usize,
    }

    impl KeywordModel for ThresholdModel {
        fn name(&self) -> &str {
            &self.name
        }

        fn predict(&mut self, _samples: &[i16]) -> Result<f32> {
            Ok(if self.scores.is_empty() {
                0.0
            } else {
                self.scores.remove(0)
            })
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    #[test]
    fn acoustic_gate_fires_on_threshold_crossing() {
        let model = ThresholdModel {
            name: "hey_chat".into(),
            scores: vec![0.1, 0.4, 0.7, 0.2],
            resets: 0,
        };
        let mut gate = AcousticGate::new(vec![Box::new(model)], 0.5).expect("gate");
        let frame = Frame::new(0, vec![0; 512], 16_000);

        assert!(gate.feed(&frame, Verdict::Silence).is_none());
        assert!(gate.feed(&frame, Verdict::Silence).is_none());
        let hit = gate.feed(&frame, Verdict::Speech).expect("trigger");
        assert_eq!(hit.phrase, "hey_chat");
        assert_relative_eq!(hit.score, 0.7);
        assert!(gate.feed(&frame, Verdict::Speech).is_none());
    }

    #[test]
    fn acoustic_gate_requires_a_model() {
        assert!(AcousticGate::new(Vec::new(), 0.5).is_err());
    }
}
