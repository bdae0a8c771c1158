//! # hark-core
//!
//! Voice-activated assistant core: continuous capture, speech gating, wake
//! phrase detection and the session state machine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioSource (capture thread) → frame queue (drop-oldest)
//!                                                  │
//!                                      SessionController (spawn_blocking)
//!                                                  │
//!                                        Classifier + NoiseFloor
//!                                                  │
//!                         ┌────────── Route (one at a time) ──────────┐
//!                         ▼                                           ▼
//!                   WakeWordGate                              UtteranceRecorder
//!                         │                                           │
//!                      trigger                 Transcriber → ChatModel ⇄ ToolInvoker
//!                                                                     │
//!                                                     Synthesizer → AudioSink
//! ```
//!
//! Phase, activity and turn events go out on `tokio::sync::broadcast`
//! channels. Providers plug in through the traits in [`collaborators`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod recorder;
pub mod session;
pub mod wake;

// Convenience re-exports for downstream crates
pub use audio::{CpalInput, CpalOutput, DeviceDescriptor, DeviceRef};
pub use collaborators::{
    ChatModel, ChatReply, Collaborators, DeviceCatalog, Message, NoTools, Role, Synthesizer,
    ToolCall, ToolInvoker, ToolSpec, Transcriber,
};
pub use config::AssistantConfig;
pub use engine::{Assistant, GateFactory};
pub use error::{CollaboratorKind, HarkError};
pub use ipc::events::{AudioActivityEvent, Phase, PhaseEvent, TurnEvent, TurnKind};
pub use session::DiagnosticsSnapshot;
