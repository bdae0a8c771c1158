//! Event types published on `tokio::sync::broadcast` channels.
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `PhaseEvent` | `Assistant::subscribe_phase` |
//! | `AudioActivityEvent` | `Assistant::subscribe_activity` |
//! | `TurnEvent` | `Assistant::subscribe_turns` |
//!
//! All events serialize with camelCase fields and lowercase enum tags so a
//! host can forward them verbatim as JSON.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session phase
// ---------------------------------------------------------------------------

/// Session phase. Owned and changed only by the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not capturing.
    Idle,
    /// Waiting for the wake phrase.
    Listening,
    /// Playing the activation cue.
    Acknowledging,
    /// Capturing the user's utterance.
    Recording,
    /// Waiting on transcription, chat and synthesis.
    Processing,
    /// Playing the reply.
    Responding,
    /// Follow-up window: speech is recorded without the wake phrase.
    CoolingDown,
}

/// Emitted on every phase change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEvent {
    pub phase: Phase,
    pub previous: Phase,
    /// Why the change happened, set for error and timeout paths.
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Audio activity
// ---------------------------------------------------------------------------

/// Emitted for each classified frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Frame sequence number.
    pub seq: u64,
    /// RMS level on the i16 scale.
    pub rms: f32,
    pub is_speech: bool,
    /// `None` until the noise floor has adapted.
    pub snr_db: Option<f32>,
}

// ---------------------------------------------------------------------------
// Conversation turns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    /// Wake phrase detected.
    Trigger,
    /// User utterance transcribed.
    Transcript,
    /// Tool invoked by the chat model.
    Tool,
    /// Assistant reply text.
    Reply,
    /// A collaborator or playback failure ended the turn.
    Error,
}

/// Emitted as a turn progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    /// Monotonically increasing per assistant, shared by all events of a turn.
    pub turn_id: u64,
    pub kind: TurnKind,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_event_serializes_with_lowercase_phase() {
        let event = PhaseEvent {
            phase: Phase::CoolingDown,
            previous: Phase::Responding,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize phase event");
        assert_eq!(json["phase"], "coolingdown");
        assert_eq!(json["previous"], "responding");
        assert!(json["detail"].is_null());

        let back: PhaseEvent = serde_json::from_value(json).expect("deserialize phase event");
        assert_eq!(back.phase, Phase::CoolingDown);
    }

    #[test]
    fn phase_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<Phase>(r#""Listening""#).is_err());
        assert_eq!(
            serde_json::from_str::<Phase>(r#""listening""#).expect("lowercase"),
            Phase::Listening
        );
    }

    #[test]
    fn audio_activity_event_uses_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            rms: 812.5,
            is_speech: true,
            snr_db: Some(14.0),
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["isSpeech"], true);
        let snr = json["snrDb"].as_f64().expect("snr should serialize as number");
        assert!((snr - 14.0).abs() < 1e-5);
    }

    #[test]
    fn turn_event_carries_kind_and_id() {
        let event = TurnEvent {
            turn_id: 9,
            kind: TurnKind::Transcript,
            text: "what's the weather".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize turn event");
        assert_eq!(json["turnId"], 9);
        assert_eq!(json["kind"], "transcript");
    }
}
