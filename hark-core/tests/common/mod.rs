#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use hark_core::audio::{FaultSlot, InputBackend, InputStream, OutputBackend};
use hark_core::buffering::{frame::encode_wav, AudioProducer, Frame, Producer};
use hark_core::classifier::Verdict;
use hark_core::wake::{TriggerEvent, WakeWordGate};
use hark_core::{
    ChatModel, ChatReply, CollaboratorKind, Collaborators, DeviceRef, HarkError, Message,
    NoTools, Synthesizer, ToolInvoker, ToolSpec, Transcriber,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

pub const SR: u32 = 16_000;
pub const N: usize = 512;

pub fn speech_samples() -> Vec<f32> {
    (0..N)
        .map(|i| {
            let t = i as f32 / SR as f32;
            (8_000.0 / 32_767.0) * (2.0 * std::f32::consts::PI * 500.0 * t).sin()
        })
        .collect()
}

pub fn speech_frame(seq: u64) -> Frame {
    Frame::from_f32(seq, &speech_samples(), SR)
}

pub fn silent_frame(seq: u64) -> Frame {
    Frame::new(seq, vec![0; N], SR)
}

/// A short WAV reply, as a synthesizer would return.
pub fn reply_wav() -> Vec<u8> {
    let frames: Vec<Frame> = (0..4).map(speech_frame).collect();
    encode_wav(&frames, SR).expect("encode reply")
}

// ── Audio doubles ───────────────────────────────────────────────────────────

struct NullStream;

impl InputStream for NullStream {
    fn sample_rate(&self) -> u32 {
        SR
    }
}

/// Opens successfully and never delivers audio.
#[derive(Default)]
pub struct IdleInput {
    pub opens: Arc<AtomicUsize>,
}

impl InputBackend for IdleInput {
    fn open(
        &self,
        _device: &DeviceRef,
        _producer: AudioProducer,
        _fault: FaultSlot,
    ) -> hark_core::error::Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NullStream))
    }
}

/// Every open fails.
#[derive(Default)]
pub struct BrokenInput {
    pub opens: Arc<AtomicUsize>,
}

impl InputBackend for BrokenInput {
    fn open(
        &self,
        device: &DeviceRef,
        _producer: AudioProducer,
        _fault: FaultSlot,
    ) -> hark_core::error::Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(HarkError::Device(format!("{device} unavailable")))
    }
}

/// Opens successfully `good_opens` times, then every open fails. Keeps the
/// live stream's fault slot so a test can pull the device mid-session.
#[derive(Clone)]
pub struct FlakyInput {
    pub good_opens: usize,
    pub opens: Arc<AtomicUsize>,
    slot: Arc<Mutex<Option<FaultSlot>>>,
}

impl FlakyInput {
    pub fn new(good_opens: usize) -> Self {
        Self {
            good_opens,
            opens: Arc::new(AtomicUsize::new(0)),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Report a runtime fault on the open stream. False if none is open yet.
    pub fn unplug(&self, message: &str) -> bool {
        match self.slot.lock().as_ref() {
            Some(slot) => {
                slot.report(message);
                true
            }
            None => false,
        }
    }
}

impl InputBackend for FlakyInput {
    fn open(
        &self,
        device: &DeviceRef,
        _producer: AudioProducer,
        fault: FaultSlot,
    ) -> hark_core::error::Result<Box<dyn InputStream>> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.good_opens {
            return Err(HarkError::Device(format!("{device} gone")));
        }
        *self.slot.lock() = Some(fault);
        Ok(Box::new(NullStream))
    }
}

struct PacedStream {
    alive: Arc<AtomicBool>,
}

impl InputStream for PacedStream {
    fn sample_rate(&self) -> u32 {
        SR
    }
}

impl Drop for PacedStream {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Plays a script of frames into the ring, one frame per `pace`, then
/// silence until the stream is dropped.
pub struct ScriptedInput {
    pub script: Vec<Vec<f32>>,
    pub pace: Duration,
}

impl ScriptedInput {
    /// `(count, speech?)` segments.
    pub fn from_segments(segments: &[(usize, bool)], pace: Duration) -> Self {
        let mut script = Vec::new();
        for &(count, speech) in segments {
            for _ in 0..count {
                script.push(if speech {
                    speech_samples()
                } else {
                    vec![0.0; N]
                });
            }
        }
        Self { script, pace }
    }
}

impl InputBackend for ScriptedInput {
    fn open(
        &self,
        _device: &DeviceRef,
        mut producer: AudioProducer,
        _fault: FaultSlot,
    ) -> hark_core::error::Result<Box<dyn InputStream>> {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let script = self.script.clone();
        let pace = self.pace;
        thread::spawn(move || {
            let silence = vec![0.0f32; N];
            let mut frames = script.into_iter();
            while flag.load(Ordering::SeqCst) {
                let next = frames.next().unwrap_or_else(|| silence.clone());
                producer.push_slice(&next);
                thread::sleep(pace);
            }
        });
        Ok(Box::new(PacedStream { alive }))
    }
}

/// Records every clip it is asked to play.
#[derive(Default)]
pub struct RecordingOutput {
    pub played: Arc<Mutex<Vec<usize>>>,
}

impl OutputBackend for RecordingOutput {
    fn output_rate(&self, _device: &DeviceRef) -> hark_core::error::Result<u32> {
        Ok(SR)
    }

    fn play(
        &self,
        _device: &DeviceRef,
        samples: &[f32],
        _sample_rate: u32,
    ) -> hark_core::error::Result<()> {
        self.played.lock().push(samples.len());
        Ok(())
    }
}

// ── Gate double ─────────────────────────────────────────────────────────────

/// Triggers on the `after`-th speech frame since the last reset.
pub struct CountingGate {
    pub after: usize,
    seen: usize,
    pub resets: Arc<AtomicUsize>,
}

impl CountingGate {
    pub fn new(after: usize) -> Self {
        Self {
            after,
            seen: 0,
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl WakeWordGate for CountingGate {
    fn feed(&mut self, _frame: &Frame, verdict: Verdict) -> Option<TriggerEvent> {
        if !verdict.is_speech() {
            return None;
        }
        self.seen += 1;
        (self.seen == self.after).then(|| TriggerEvent {
            phrase: "hey chat".into(),
            transcript: Some("hey chat".into()),
            score: 1.0,
        })
    }

    fn reset(&mut self) {
        self.seen = 0;
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Collaborator doubles ────────────────────────────────────────────────────

pub struct FixedTranscriber {
    pub text: String,
    pub calls: Arc<AtomicUsize>,
}

impl FixedTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Transcriber for FixedTranscriber {
    fn transcribe(&self, wav: &[u8], _language: Option<&str>) -> hark_core::error::Result<String> {
        assert!(wav.starts_with(b"RIFF"), "transcriber expects WAV bytes");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

/// Replies from a script; an empty script answers "Okay.".
#[derive(Default)]
pub struct ScriptedChat {
    pub replies: Mutex<VecDeque<hark_core::error::Result<ChatReply>>>,
    pub histories: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<hark_core::error::Result<ChatReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            histories: Arc::default(),
        }
    }
}

impl ChatModel for ScriptedChat {
    fn complete(
        &self,
        history: &[Message],
        _tools: &[ToolSpec],
    ) -> hark_core::error::Result<ChatReply> {
        self.histories.lock().push(history.to_vec());
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Ok(ChatReply {
                text: "Okay.".into(),
                tool_calls: Vec::new(),
            })
        })
    }
}

pub struct FailingChat;

impl ChatModel for FailingChat {
    fn complete(
        &self,
        _history: &[Message],
        _tools: &[ToolSpec],
    ) -> hark_core::error::Result<ChatReply> {
        Err(HarkError::collaborator(CollaboratorKind::Chat, "upstream 500"))
    }
}

pub struct WavSynth {
    pub calls: Arc<AtomicUsize>,
}

impl Default for WavSynth {
    fn default() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Synthesizer for WavSynth {
    fn synthesize(&self, text: &str, voice: &str) -> hark_core::error::Result<Vec<u8>> {
        assert!(!text.is_empty());
        assert!(!voice.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(reply_wav())
    }
}

pub fn collaborators(
    transcriber: Arc<dyn Transcriber>,
    chat: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolInvoker>,
) -> Collaborators {
    Collaborators {
        transcriber,
        chat,
        tools,
        synthesizer: Arc::new(WavSynth::default()),
    }
}

pub fn simple_collaborators(text: &str) -> Collaborators {
    collaborators(
        Arc::new(FixedTranscriber::new(text)),
        Arc::new(ScriptedChat::default()),
        Arc::new(NoTools),
    )
}

// ── Polling helpers ─────────────────────────────────────────────────────────

pub fn recv_event_with_timeout<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) -> T {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

/// Wait until `pred` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}
