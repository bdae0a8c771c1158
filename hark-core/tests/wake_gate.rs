mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use common::*;
use hark_core::classifier::Verdict;
use hark_core::wake::{PhraseMatcher, SnippetLimits, TranscriptionGate, TriggerEvent, WakeWordGate};
use hark_core::{CollaboratorKind, HarkError, Transcriber};

const LIMITS: SnippetLimits = SnippetLimits {
    pre_roll_frames: 2,
    window_frames: 50,
    min_speech_frames: 3,
    end_silence_ticks: 4,
};

struct SlowTranscriber {
    text: String,
    delay: Duration,
}

impl Transcriber for SlowTranscriber {
    fn transcribe(&self, _wav: &[u8], _language: Option<&str>) -> hark_core::error::Result<String> {
        thread::sleep(self.delay);
        Ok(self.text.clone())
    }
}

struct DownTranscriber {
    calls: Arc<AtomicUsize>,
}

impl Transcriber for DownTranscriber {
    fn transcribe(&self, _wav: &[u8], _language: Option<&str>) -> hark_core::error::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HarkError::collaborator(
            CollaboratorKind::Transcription,
            "service unavailable",
        ))
    }
}

fn gate(matcher: PhraseMatcher, transcriber: Arc<dyn Transcriber>) -> TranscriptionGate {
    TranscriptionGate::new(
        matcher,
        transcriber,
        LIMITS,
        SR,
        Some("en".into()),
        Duration::from_secs(2),
    )
}

/// Feed silence, `speech` voiced frames, then enough silence to close the snippet.
fn say(gate: &mut TranscriptionGate, speech: usize) -> Option<TriggerEvent> {
    let mut seq = 0;
    let mut next = |v: Verdict| {
        seq += 1;
        match v {
            Verdict::Speech => speech_frame(seq),
            Verdict::Silence => silent_frame(seq),
        }
    };
    for _ in 0..2 {
        let f = next(Verdict::Silence);
        assert!(gate.feed(&f, Verdict::Silence).is_none());
    }
    for _ in 0..speech {
        let f = next(Verdict::Speech);
        if let Some(t) = gate.feed(&f, Verdict::Speech) {
            return Some(t);
        }
    }
    for _ in 0..LIMITS.end_silence_ticks {
        let f = next(Verdict::Silence);
        if let Some(t) = gate.feed(&f, Verdict::Silence) {
            return Some(t);
        }
    }
    None
}

fn poll_for_trigger(gate: &mut TranscriptionGate, timeout: Duration) -> Option<TriggerEvent> {
    let mut found = None;
    wait_until(timeout, || {
        found = gate.poll();
        found.is_some()
    });
    found
}

#[test]
fn near_miss_transcript_triggers_above_similarity_threshold() {
    let matcher = PhraseMatcher::new(&["hey chat".to_string()], false, Some(0.75));
    let transcriber = Arc::new(FixedTranscriber::new("Hey chats."));
    let calls = Arc::clone(&transcriber.calls);
    let mut gate = gate(matcher, transcriber);

    assert!(say(&mut gate, 5).is_none(), "result arrives asynchronously");
    let trigger = poll_for_trigger(&mut gate, Duration::from_secs(2)).expect("trigger");

    assert_eq!(trigger.phrase, "hey chat");
    assert_eq!(trigger.transcript.as_deref(), Some("hey chats"));
    assert_relative_eq!(trigger.score, 16.0 / 17.0, epsilon = 1e-6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!gate.is_busy());
}

#[test]
fn substring_gate_finds_phrase_in_a_sentence() {
    let matcher = PhraseMatcher::new(&["hey chat".to_string()], true, None);
    let mut gate = gate(
        matcher,
        Arc::new(FixedTranscriber::new("okay so, hey chat, what's up")),
    );
    say(&mut gate, 6);
    let trigger = poll_for_trigger(&mut gate, Duration::from_secs(2)).expect("trigger");
    assert_eq!(trigger.phrase, "hey chat");
    assert_relative_eq!(trigger.score, 1.0);
}

#[test]
fn unrelated_speech_does_not_trigger() {
    let matcher = PhraseMatcher::new(&["hey chat".to_string()], true, Some(0.85));
    let mut gate = gate(matcher, Arc::new(FixedTranscriber::new("good morning everyone")));
    say(&mut gate, 6);
    assert!(poll_for_trigger(&mut gate, Duration::from_millis(300)).is_none());
    assert_eq!(gate.failures(), 0);
}

#[test]
fn short_snippets_are_not_transcribed() {
    let transcriber = Arc::new(FixedTranscriber::new("hey chat"));
    let calls = Arc::clone(&transcriber.calls);
    let mut gate = gate(
        PhraseMatcher::new(&["hey chat".to_string()], true, None),
        transcriber,
    );
    say(&mut gate, 2);
    assert!(!gate.is_busy());
    thread::sleep(Duration::from_millis(50));
    assert!(gate.poll().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn transcription_failure_is_counted_and_ignored() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut gate = gate(
        PhraseMatcher::new(&["hey chat".to_string()], true, None),
        Arc::new(DownTranscriber {
            calls: Arc::clone(&calls),
        }),
    );
    say(&mut gate, 5);
    assert!(wait_until(Duration::from_secs(2), || {
        gate.poll();
        gate.failures() == 1
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn reset_abandons_an_in_flight_snippet() {
    let mut gate = gate(
        PhraseMatcher::new(&["hey chat".to_string()], true, None),
        Arc::new(SlowTranscriber {
            text: "hey chat".into(),
            delay: Duration::from_millis(100),
        }),
    );
    say(&mut gate, 5);
    assert!(gate.is_busy());
    gate.reset();
    assert!(!gate.is_busy());
    thread::sleep(Duration::from_millis(200));
    assert!(gate.poll().is_none());
}

#[test]
fn gate_built_from_config_uses_configured_phrases() {
    let mut cfg = hark_core::AssistantConfig::default();
    cfg.wake.phrases = vec!["Computer".into()];
    let gate = TranscriptionGate::from_config(&cfg, Arc::new(FixedTranscriber::new("")));
    assert!(!gate.is_busy());
    assert_eq!(gate.failures(), 0);

    let limits = SnippetLimits::from_config(&cfg);
    // 0.6 s of trailing silence at 32 ms frames.
    assert_eq!(limits.end_silence_ticks, 19);
    assert_eq!(limits.window_frames, 94);
}
