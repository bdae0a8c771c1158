//! `Assistant`: top-level lifecycle handle around the session controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Assistant::new()
//!     └─► start()        → capture open, controller spawned, phase = Listening
//!         └─► stop()     → run flag cleared, controller stops, phase = Idle
//! ```
//!
//! `start()`/`stop()` return an error in the wrong state rather than panicking.
//!
//! Each `start()` creates a fresh run with its own stop flag, so a late
//! `start()` can never revive a controller that was already told to stop.
//! The run's final result is delivered on the channel from
//! [`Assistant::take_exit`]; an unrecoverable capture fault arrives there.
//!
//! ## Threading
//!
//! The controller runs on a `spawn_blocking` thread. It owns the capture
//! source, which opens the device on its own thread because `cpal::Stream`
//! is `!Send`. A sync oneshot channel carries the open result back to the
//! `start()` caller.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

use crate::{
    audio::{AudioSource, CpalInput, CpalOutput, InputBackend, OutputBackend},
    collaborators::Collaborators,
    config::{AssistantConfig, WakeStrategy},
    error::{HarkError, Result},
    ipc::events::{AudioActivityEvent, Phase, PhaseEvent, TurnEvent},
    playback::AudioSink,
    session::{DiagnosticsSnapshot, SessionController, SessionDiagnostics, SessionEvents},
    wake::{TranscriptionGate, WakeWordGate},
};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// How long `start()` waits for a stopping run to release the device.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// One controller run.
struct Run {
    /// Cleared by `stop()`. Only this run's controller reads it.
    keep_going: Arc<AtomicBool>,
    /// Cleared by the controller thread on exit.
    alive: Arc<AtomicBool>,
    exit: Option<oneshot::Receiver<Result<()>>>,
}

impl Run {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_stopping(&self) -> bool {
        !self.keep_going.load(Ordering::SeqCst)
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

/// Builds a fresh wake gate for each run.
pub type GateFactory = Arc<dyn Fn() -> Result<Box<dyn WakeWordGate>> + Send + Sync>;

/// The top-level assistant handle.
///
/// `Assistant` is `Send + Sync`; wrap it in `Arc` to share it with
/// event-forwarding tasks.
pub struct Assistant {
    config: AssistantConfig,
    collaborators: Collaborators,
    input: Arc<dyn InputBackend>,
    output: Arc<dyn OutputBackend>,
    gate_factory: GateFactory,
    run: Mutex<Option<Run>>,
    events: SessionEvents,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Assistant {
    /// Create an assistant on the cpal backends. Does not start capturing.
    ///
    /// # Errors
    /// `HarkError::Config` if the configuration does not validate.
    pub fn new(config: AssistantConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let gate_config = config.clone();
        let transcriber = Arc::clone(&collaborators.transcriber);
        let gate_factory: GateFactory = Arc::new(move || match gate_config.wake.strategy {
            WakeStrategy::Transcription => Ok(Box::new(TranscriptionGate::from_config(
                &gate_config,
                Arc::clone(&transcriber),
            )) as Box<dyn WakeWordGate>),
            WakeStrategy::Acoustic => Err(HarkError::Config(
                "acoustic wake strategy needs a keyword model gate".into(),
            )),
        });

        Ok(Self {
            config,
            collaborators,
            input: Arc::new(CpalInput),
            output: Arc::new(CpalOutput),
            gate_factory,
            run: Mutex::new(None),
            events: SessionEvents::new(BROADCAST_CAP),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        })
    }

    /// Replace the audio backends.
    pub fn with_backends(
        mut self,
        input: Arc<dyn InputBackend>,
        output: Arc<dyn OutputBackend>,
    ) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    /// Replace the wake gate, e.g. with an `AcousticGate` over keyword models.
    pub fn with_gate(mut self, factory: GateFactory) -> Self {
        self.gate_factory = factory;
        self
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// `true` while a controller thread is alive, including one that was
    /// asked to stop and has not finished its current step.
    pub fn is_running(&self) -> bool {
        self.run.lock().as_ref().is_some_and(Run::is_alive)
    }

    /// Result of the current run, delivered when its controller exits.
    ///
    /// `Ok(())` after `stop()`; the fatal error when capture could not be
    /// restarted on any candidate. Returns `None` before a successful
    /// `start()` or if already taken for this run.
    pub fn take_exit(&self) -> Option<oneshot::Receiver<Result<()>>> {
        self.run.lock().as_mut().and_then(|run| run.exit.take())
    }

    /// Open capture and start the session controller.
    ///
    /// Blocks until capture is confirmed open (or every attempt failed).
    /// After `stop()`, first waits for the previous controller to exit.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `HarkError::AlreadyRunning` if already started, or if the previous
    ///   run is still stopping after a few seconds.
    /// - `HarkError::Device` / `HarkError::NoInputDevice` when no candidate opens.
    pub fn start(&self) -> Result<()> {
        let mut current = self.run.lock();
        if let Some(run) = current.as_ref() {
            if run.is_alive() && !run.is_stopping() {
                return Err(HarkError::AlreadyRunning);
            }
            // A stopped run still owns the device until its step returns.
            if !run.wait_exit(STOP_WAIT) {
                warn!("previous session still stopping");
                return Err(HarkError::AlreadyRunning);
            }
        }
        *current = None;
        self.diagnostics.reset();

        let gate = (self.gate_factory)()?;

        let config = self.config.clone();
        let collaborators = self.collaborators.clone();
        let input = Arc::clone(&self.input);
        let output = Arc::clone(&self.output);
        let events = self.events.clone();
        let diagnostics = Arc::clone(&self.diagnostics);
        let keep_going = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));
        let run_flag = Arc::clone(&keep_going);
        let alive_flag = Arc::clone(&alive);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (exit_tx, exit_rx) = oneshot::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            let source = AudioSource::new(input, config.audio.clone());
            let sink = AudioSink::new(
                output,
                config.devices.output_candidates.clone(),
                config.devices.playback_attempts,
                config.cues.clone(),
            );
            let built = SessionController::new(
                config,
                source,
                sink,
                gate,
                collaborators,
                events,
                diagnostics,
            );
            let mut controller = match built {
                Ok(c) => c,
                Err(e) => {
                    alive_flag.store(false, Ordering::SeqCst);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = controller.start() {
                alive_flag.store(false, Ordering::SeqCst);
                let _ = open_tx.send(Err(e));
                return;
            }
            let _ = open_tx.send(Ok(()));

            let result = controller.run(&run_flag);
            if let Err(e) = &result {
                error!("session ended: {e}");
            }
            alive_flag.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(result);
        });

        match open_rx.recv() {
            Ok(Ok(())) => {
                *current = Some(Run {
                    keep_going,
                    alive,
                    exit: Some(exit_rx),
                });
                info!("assistant started, listening for the wake phrase");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HarkError::Other(anyhow::anyhow!(
                "session task died unexpectedly"
            ))),
        }
    }

    /// Ask the controller to stop. The phase becomes `Idle` once the current
    /// step returns.
    ///
    /// # Errors
    /// `HarkError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let current = self.run.lock();
        match current.as_ref() {
            Some(run) if run.is_alive() && run.keep_going.swap(false, Ordering::SeqCst) => {
                info!("assistant stop requested");
                Ok(())
            }
            _ => Err(HarkError::NotRunning),
        }
    }

    /// Current phase (snapshot).
    pub fn status(&self) -> Phase {
        *self.events.phase.lock()
    }

    pub fn subscribe_phase(&self) -> broadcast::Receiver<PhaseEvent> {
        self.events.phase_tx.subscribe()
    }

    /// Per-frame level and verdict.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.events.activity_tx.subscribe()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.turn_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}
