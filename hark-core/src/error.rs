use std::fmt;

use thiserror::Error;

/// Which external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    Transcription,
    Chat,
    Tool,
    Synthesis,
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollaboratorKind::Transcription => "transcription",
            CollaboratorKind::Chat => "chat",
            CollaboratorKind::Tool => "tool",
            CollaboratorKind::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

/// All errors produced by hark-core.
#[derive(Debug, Error)]
pub enum HarkError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("no usable input device found")]
    NoInputDevice,

    #[error("malformed frame: {0}")]
    Classification(String),

    #[error("{what} timed out")]
    Timeout { what: String },

    #[error("{kind} collaborator failed: {message}")]
    Collaborator {
        kind: CollaboratorKind,
        message: String,
    },

    #[error("playback error: {0}")]
    Playback(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("assistant is already running")]
    AlreadyRunning,

    #[error("assistant is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarkError {
    pub fn collaborator(kind: CollaboratorKind, message: impl Into<String>) -> Self {
        HarkError::Collaborator {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        HarkError::Timeout { what: what.into() }
    }

    /// Device faults are the only errors that tear down capture.
    pub fn is_device(&self) -> bool {
        matches!(self, HarkError::Device(_) | HarkError::NoInputDevice)
    }
}

pub type Result<T> = std::result::Result<T, HarkError>;
