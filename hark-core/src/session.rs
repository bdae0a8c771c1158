//! Session controller: the state machine that drives capture, the wake gate,
//! the recorder, the collaborators and playback.
//!
//! ## Phases
//!
//! ```text
//! Idle ─start─► Listening ─trigger─► Acknowledging ─► Recording ─speech─► Processing
//!                  ▲                                     │ empty/timeout       │
//!                  ├─────────────────────────────────────┘                     │ ok
//!                  ├──────────── collaborator failure ◄────────────────────────┤
//!                  │                                                           ▼
//!                  └──── cooldown elapsed ◄── CoolingDown ◄──playback── Responding
//!                                              │  ▲
//!                                      speech  ▼  │ reply played
//!                                            Recording
//! ```
//!
//! The controller is the only writer of the [`Session`]. [`SessionController::set_phase`]
//! is the only place the frame [`Route`] changes: the wake gate and the
//! recorder are never subscribed at the same time.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::audio::AudioSource;
use crate::buffering::{Frame, FrameReceiver, FrameRecv};
use crate::classifier::{Classifier, NoiseFloor};
use crate::collaborators::{call_with_deadline, Collaborators, ToolSpec};
use crate::config::AssistantConfig;
use crate::conversation::Conversation;
use crate::error::{CollaboratorKind, HarkError, Result};
use crate::ipc::events::{AudioActivityEvent, Phase, PhaseEvent, TurnEvent, TurnKind};
use crate::playback::{AudioSink, Clip, Cue};
use crate::recorder::{RecorderLimits, RecorderStep, Utterance, UtteranceRecorder};
use crate::wake::{TriggerEvent, WakeWordGate};

/// Frames between periodic level checks in the debug log.
const LEVEL_LOG_INTERVAL: usize = 100;

/// How long one `tick` waits for a frame.
const FRAME_WAIT: Duration = Duration::from_millis(20);

// ── Diagnostics ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SessionDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub speech_ticks: AtomicUsize,
    pub triggers: AtomicUsize,
    pub utterances: AtomicUsize,
    pub empty_utterances: AtomicUsize,
    pub recording_timeouts: AtomicUsize,
    pub collaborator_errors: AtomicUsize,
    pub playback_errors: AtomicUsize,
    pub capture_restarts: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            speech_ticks: self.speech_ticks.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            utterances: self.utterances.load(Ordering::Relaxed),
            empty_utterances: self.empty_utterances.load(Ordering::Relaxed),
            recording_timeouts: self.recording_timeouts.load(Ordering::Relaxed),
            collaborator_errors: self.collaborator_errors.load(Ordering::Relaxed),
            playback_errors: self.playback_errors.load(Ordering::Relaxed),
            capture_restarts: self.capture_restarts.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 10] {
        [
            &self.frames_in,
            &self.frames_dropped,
            &self.speech_ticks,
            &self.triggers,
            &self.utterances,
            &self.empty_utterances,
            &self.recording_timeouts,
            &self.collaborator_errors,
            &self.playback_errors,
            &self.capture_restarts,
        ]
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_dropped: usize,
    pub speech_ticks: usize,
    pub triggers: usize,
    pub utterances: usize,
    pub empty_utterances: usize,
    pub recording_timeouts: usize,
    pub collaborator_errors: usize,
    pub playback_errors: usize,
    pub capture_restarts: usize,
}

// ── Session state ───────────────────────────────────────────────────────────

/// Which consumer the frame stream is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    None,
    Gate,
    Recorder,
}

impl Route {
    fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Listening => Route::Gate,
            Phase::Recording | Phase::CoolingDown => Route::Recorder,
            Phase::Idle | Phase::Acknowledging | Phase::Processing | Phase::Responding => {
                Route::None
            }
        }
    }
}

/// Phase, last meaningful interaction and the configuration snapshot.
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    last_interaction: Instant,
    config: Arc<AssistantConfig>,
}

impl Session {
    fn new(config: Arc<AssistantConfig>) -> Self {
        Self {
            phase: Phase::Idle,
            last_interaction: Instant::now(),
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_interaction(&self) -> Instant {
        self.last_interaction
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }
}

/// Broadcast senders and the shared phase mirror read by `Assistant::status`.
#[derive(Clone)]
pub struct SessionEvents {
    pub phase_tx: broadcast::Sender<PhaseEvent>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub turn_tx: broadcast::Sender<TurnEvent>,
    pub phase: Arc<Mutex<Phase>>,
}

impl SessionEvents {
    pub fn new(capacity: usize) -> Self {
        let (phase_tx, _) = broadcast::channel(capacity);
        let (activity_tx, _) = broadcast::channel(capacity);
        let (turn_tx, _) = broadcast::channel(capacity);
        Self {
            phase_tx,
            activity_tx,
            turn_tx,
            phase: Arc::new(Mutex::new(Phase::Idle)),
        }
    }
}

/// Outcome of running the collaborator chain for one utterance.
enum TurnOutcome {
    Reply(Vec<u8>),
    /// Transcription came back empty; nothing to answer.
    Nothing,
}

// ── Controller ──────────────────────────────────────────────────────────────

pub struct SessionController {
    session: Session,
    route: Route,
    classifier: Classifier,
    floor: NoiseFloor,
    gate: Box<dyn WakeWordGate>,
    recorder: UtteranceRecorder,
    limits: RecorderLimits,
    max_utterance: Duration,
    source: AudioSource,
    frames: Option<FrameReceiver>,
    dropped_seen: usize,
    sink: AudioSink,
    collaborators: Collaborators,
    tool_specs: Vec<ToolSpec>,
    conversation: Conversation,
    events: SessionEvents,
    diagnostics: Arc<SessionDiagnostics>,
    turn_id: u64,
}

impl SessionController {
    /// # Errors
    /// `HarkError::Config` if the configuration does not validate.
    pub fn new(
        config: AssistantConfig,
        source: AudioSource,
        sink: AudioSink,
        gate: Box<dyn WakeWordGate>,
        collaborators: Collaborators,
        events: SessionEvents,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::new(
            config.classifier.clone(),
            config.audio.sample_rate,
            config.audio.frame_size,
        )?;
        let floor = NoiseFloor::new(config.classifier.baseline_smoothing);
        let limits = RecorderLimits::from_config(&config.audio, &config.recorder);
        let max_utterance = Duration::from_secs_f32(config.recorder.max_utterance_secs);
        let conversation = Conversation::new(
            &config.session.system_prompt,
            config.session.max_history_messages,
        );
        let tool_specs = collaborators.tools.tools();
        if !tool_specs.is_empty() {
            info!(tools = tool_specs.len(), "tools available to the chat model");
        }

        Ok(Self {
            session: Session::new(Arc::new(config)),
            route: Route::None,
            classifier,
            floor,
            gate,
            recorder: UtteranceRecorder::new(limits, max_utterance),
            limits,
            max_utterance,
            source,
            frames: None,
            dropped_seen: 0,
            sink,
            collaborators,
            tool_specs,
            conversation,
            events,
            diagnostics,
            turn_id: 0,
        })
    }

    /// Override the recorder limits derived from configuration.
    pub fn with_recorder_limits(mut self, limits: RecorderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Open capture and move `Idle → Listening`.
    ///
    /// # Errors
    /// The last device error once every capture attempt has failed. The
    /// session stays `Idle`.
    pub fn start(&mut self) -> Result<()> {
        if self.session.phase != Phase::Idle {
            return Err(HarkError::AlreadyRunning);
        }
        self.open_capture()?;
        self.set_phase(Phase::Listening, None);
        Ok(())
    }

    /// Release capture and return to `Idle`.
    pub fn stop(&mut self) {
        self.source.stop();
        self.frames = None;
        self.set_phase(Phase::Idle, Some("stopped".into()));
        let d = self.diagnostics.snapshot();
        info!(
            frames_in = d.frames_in,
            frames_dropped = d.frames_dropped,
            triggers = d.triggers,
            utterances = d.utterances,
            empty_utterances = d.empty_utterances,
            collaborator_errors = d.collaborator_errors,
            playback_errors = d.playback_errors,
            capture_restarts = d.capture_restarts,
            "session stopped"
        );
    }

    /// Start, then tick until `running` is cleared. Always stops on exit.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        if self.session.phase == Phase::Idle {
            self.start()?;
        }
        let result = loop {
            if !running.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                break Err(e);
            }
        };
        self.stop();
        result
    }

    /// One controller step: fault and timer checks, then at most one frame.
    ///
    /// # Errors
    /// Only a capture restart that fails on every candidate is fatal.
    pub fn tick(&mut self) -> Result<()> {
        if self.session.phase == Phase::Idle {
            return Err(HarkError::NotRunning);
        }

        if let Some(fault) = self.source.take_fault() {
            return self.restart_capture(fault);
        }

        if self.session.phase == Phase::CoolingDown
            && self.session.last_interaction.elapsed() >= self.session.config.session.cooldown()
        {
            self.sink.play_cue(Cue::Sleep);
            self.set_phase(Phase::Listening, Some("cooldown elapsed".into()));
        }

        if self.route == Route::Gate {
            if let Some(trigger) = self.gate.poll() {
                self.on_trigger(trigger);
                return Ok(());
            }
        }

        let recv = match &self.frames {
            Some(rx) => rx.recv_timeout(FRAME_WAIT),
            None => FrameRecv::Closed,
        };
        match recv {
            FrameRecv::Frame(frame) => {
                self.handle_frame(frame);
                Ok(())
            }
            FrameRecv::Empty => Ok(()),
            FrameRecv::Closed => {
                self.restart_capture(HarkError::Device("capture stream closed".into()))
            }
        }
    }

    fn open_capture(&mut self) -> Result<()> {
        let devices = self.session.config.devices.clone();
        let mut last_error = HarkError::NoInputDevice;
        for attempt in 0..devices.capture_attempts as usize {
            let device = &devices.input_candidates[attempt % devices.input_candidates.len()];
            match self.source.start(device) {
                Ok(rx) => {
                    info!(device = %device, attempt, "capture open");
                    self.dropped_seen = 0;
                    self.frames = Some(rx);
                    return Ok(());
                }
                Err(e) if e.is_device() => {
                    warn!(device = %device, attempt, "capture open failed: {e}");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    fn restart_capture(&mut self, fault: HarkError) -> Result<()> {
        warn!("capture fault: {fault}");
        SessionDiagnostics::bump(&self.diagnostics.capture_restarts);
        self.source.stop();
        self.frames = None;
        self.set_phase(Phase::Idle, Some(fault.to_string()));
        self.open_capture()?;
        self.set_phase(Phase::Listening, Some("capture restarted".into()));
        Ok(())
    }

    // ── Frame handling ──────────────────────────────────────────────────────

    /// Classify one frame and hand it to whichever consumer is routed.
    pub fn handle_frame(&mut self, frame: Frame) {
        let frames_in = self.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(rx) = &self.frames {
            let dropped = rx.dropped();
            if dropped > self.dropped_seen {
                self.diagnostics
                    .frames_dropped
                    .fetch_add(dropped - self.dropped_seen, Ordering::Relaxed);
                self.dropped_seen = dropped;
            }
        }

        let c = self.classifier.classify_or_silence(&frame, &self.floor);
        if c.is_speech() {
            SessionDiagnostics::bump(&self.diagnostics.speech_ticks);
        } else {
            self.floor.adapt(&c);
        }

        let _ = self.events.activity_tx.send(AudioActivityEvent {
            seq: frame.seq,
            rms: c.rms,
            is_speech: c.is_speech(),
            snr_db: self.floor.is_adapted().then_some(c.snr_db),
        });

        if frames_in % LEVEL_LOG_INTERVAL == 0 {
            debug!(
                frames_in,
                rms = c.rms,
                floor_rms = self.floor.rms,
                phase = ?self.session.phase,
                "level check"
            );
        }

        match self.route {
            Route::None => {}
            Route::Gate => {
                if let Some(trigger) = self.gate.feed(&frame, c.verdict) {
                    self.on_trigger(trigger);
                }
            }
            Route::Recorder => match self.recorder.push(frame, c.verdict) {
                RecorderStep::Continue => {}
                RecorderStep::SpeechStarted => {
                    self.session.last_interaction = Instant::now();
                    if self.session.phase == Phase::CoolingDown {
                        self.turn_id += 1;
                        self.set_phase(Phase::Recording, Some("follow-up speech".into()));
                    }
                }
                RecorderStep::Finished(utterance) => self.on_utterance(utterance),
                RecorderStep::TimedOut => {
                    SessionDiagnostics::bump(&self.diagnostics.recording_timeouts);
                    self.set_phase(
                        Phase::Listening,
                        Some(HarkError::timeout("utterance").to_string()),
                    );
                }
            },
        }
    }

    fn on_trigger(&mut self, trigger: TriggerEvent) {
        SessionDiagnostics::bump(&self.diagnostics.triggers);
        self.turn_id += 1;
        info!(phrase = %trigger.phrase, score = trigger.score, "wake phrase detected");
        self.publish_turn(TurnKind::Trigger, trigger.phrase);
        self.session.last_interaction = Instant::now();

        self.set_phase(Phase::Acknowledging, None);
        self.sink.play_cue(Cue::Activation);
        self.set_phase(Phase::Recording, None);
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        if utterance.is_empty() {
            SessionDiagnostics::bump(&self.diagnostics.empty_utterances);
            self.set_phase(Phase::Listening, Some("no speech".into()));
            return;
        }
        SessionDiagnostics::bump(&self.diagnostics.utterances);

        let span = info_span!("utterance", utterance_id = self.turn_id);
        let _enter = span.enter();
        info!(
            frames = utterance.len(),
            speech_frames = utterance.speech_frames(),
            duration_ms = utterance.duration().as_millis() as u64,
            "utterance finished"
        );

        self.set_phase(Phase::Processing, None);
        match self.process_utterance(&utterance) {
            Ok(TurnOutcome::Reply(wav)) => {
                self.set_phase(Phase::Responding, None);
                if let Err(e) = self.sink.play(Clip::Bytes(wav)) {
                    SessionDiagnostics::bump(&self.diagnostics.playback_errors);
                    warn!("reply playback failed: {e}");
                    self.publish_turn(TurnKind::Error, e.to_string());
                }
                self.sink.play_cue(Cue::Ready);
                self.session.last_interaction = Instant::now();
                self.set_phase(Phase::CoolingDown, None);
            }
            Ok(TurnOutcome::Nothing) => {
                self.set_phase(Phase::Listening, Some("empty transcript".into()));
            }
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.collaborator_errors);
                warn!("turn failed: {e}");
                self.publish_turn(TurnKind::Error, e.to_string());
                self.sink.play_cue(Cue::Error);
                self.set_phase(Phase::Listening, Some(e.to_string()));
            }
        }
    }

    /// Transcribe, chat (with tool rounds) and synthesize.
    fn process_utterance(&mut self, utterance: &Utterance) -> Result<TurnOutcome> {
        let cfg = Arc::clone(&self.session.config);
        let deadline = cfg.session.collaborator_timeout();

        let wav = utterance.to_wav(cfg.audio.sample_rate)?;
        let transcriber = Arc::clone(&self.collaborators.transcriber);
        let language = cfg.session.language.clone();
        let text = call_with_deadline(CollaboratorKind::Transcription, deadline, move || {
            transcriber.transcribe(&wav, language.as_deref())
        })?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(TurnOutcome::Nothing);
        }
        info!(transcript = %text, "utterance transcribed");
        self.publish_turn(TurnKind::Transcript, text.clone());

        self.conversation.push_user(text);
        let reply = match self.chat_with_tools(deadline, cfg.session.max_tool_rounds) {
            Ok(reply) => reply,
            Err(e) => {
                self.conversation.discard_last_turn();
                return Err(e);
            }
        };
        self.publish_turn(TurnKind::Reply, reply.clone());

        let synthesizer = Arc::clone(&self.collaborators.synthesizer);
        let voice = cfg.session.voice.clone();
        match call_with_deadline(CollaboratorKind::Synthesis, deadline, move || {
            synthesizer.synthesize(&reply, &voice)
        }) {
            Ok(audio) => Ok(TurnOutcome::Reply(audio)),
            Err(e) => {
                self.conversation.discard_last_turn();
                Err(e)
            }
        }
    }

    fn chat_with_tools(&mut self, deadline: Duration, max_rounds: usize) -> Result<String> {
        for round in 0..=max_rounds {
            let chat = Arc::clone(&self.collaborators.chat);
            let history = self.conversation.messages().to_vec();
            let specs = self.tool_specs.clone();
            let reply = call_with_deadline(CollaboratorKind::Chat, deadline, move || {
                chat.complete(&history, &specs)
            })?;

            if reply.tool_calls.is_empty() {
                if reply.text.trim().is_empty() {
                    return Err(HarkError::collaborator(
                        CollaboratorKind::Chat,
                        "empty reply",
                    ));
                }
                self.conversation.push_assistant(reply.text.clone(), Vec::new());
                return Ok(reply.text);
            }

            if round == max_rounds {
                break;
            }

            debug!(round, calls = reply.tool_calls.len(), "chat requested tools");
            self.conversation
                .push_assistant(reply.text.clone(), reply.tool_calls.clone());
            for call in reply.tool_calls {
                self.publish_turn(TurnKind::Tool, call.name.clone());
                let tools = Arc::clone(&self.collaborators.tools);
                let name = call.name.clone();
                let args = call.arguments.clone();
                let result = call_with_deadline(CollaboratorKind::Tool, deadline, move || {
                    tools.call(&name, args)
                })?;
                self.conversation
                    .push_tool_result(call.id, Value::Object(result).to_string());
            }
        }

        Err(HarkError::collaborator(
            CollaboratorKind::Chat,
            format!("still requesting tools after {max_rounds} rounds"),
        ))
    }

    // ── Phase changes ───────────────────────────────────────────────────────

    /// Move to `next`, re-routing the frame stream if needed.
    ///
    /// Entering a routed phase from a different route resets the new
    /// consumer and drains the frame queue, so audio queued while the
    /// assistant was speaking is not mistaken for the user.
    pub fn set_phase(&mut self, next: Phase, detail: Option<String>) {
        let previous = self.session.phase;
        if previous == next {
            return;
        }
        self.session.phase = next;

        let route = Route::for_phase(next);
        if route != self.route {
            match route {
                Route::Gate => self.gate.reset(),
                Route::Recorder => {
                    let limits = if next == Phase::CoolingDown {
                        self.limits.follow_up()
                    } else {
                        self.limits
                    };
                    self.recorder.arm(limits, self.max_utterance);
                }
                Route::None => {}
            }
            if route != Route::None {
                if let Some(rx) = &self.frames {
                    let drained = rx.drain();
                    if drained > 0 {
                        debug!(drained, ?next, "stale frames discarded");
                    }
                }
            }
            self.route = route;
        }

        match &detail {
            Some(d) => info!(?previous, phase = ?next, detail = %d, "phase changed"),
            None => info!(?previous, phase = ?next, "phase changed"),
        }
        *self.events.phase.lock() = next;
        let _ = self.events.phase_tx.send(PhaseEvent {
            phase: next,
            previous,
            detail,
        });
    }

    fn publish_turn(&self, kind: TurnKind, text: impl Into<String>) {
        let _ = self.events.turn_tx.send(TurnEvent {
            turn_id: self.turn_id,
            kind,
            text: text.into(),
        });
    }
}
