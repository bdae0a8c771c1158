//! Narrow traits for the external services the session depends on.
//!
//! All calls are synchronous. The session runs each one on a worker thread
//! through [`call_with_deadline`] so a hung provider cannot stall the
//! controller.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::audio::device::DeviceDescriptor;
use crate::error::{CollaboratorKind, HarkError, Result};

/// Speech-to-text.
pub trait Transcriber: Send + Sync {
    /// Transcribe a 16-bit mono WAV file.
    fn transcribe(&self, wav: &[u8], language: Option<&str>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call answered by a tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// A tool the chat model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Chat completion with optional tool use.
pub trait ChatModel: Send + Sync {
    fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<ChatReply>;
}

/// Tool execution.
pub trait ToolInvoker: Send + Sync {
    fn tools(&self) -> Vec<ToolSpec>;
    fn call(&self, name: &str, args: Map<String, Value>) -> Result<Map<String, Value>>;
}

/// Text-to-speech. Returns WAV bytes.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Device enumeration, used by the host's selection policy.
pub trait DeviceCatalog: Send + Sync {
    fn list_input_devices(&self) -> Vec<DeviceDescriptor>;
    fn list_output_devices(&self) -> Vec<DeviceDescriptor>;
}

/// Tool invoker with no tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

impl ToolInvoker for NoTools {
    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    fn call(&self, name: &str, _args: Map<String, Value>) -> Result<Map<String, Value>> {
        Err(HarkError::collaborator(
            CollaboratorKind::Tool,
            format!("unknown tool '{name}'"),
        ))
    }
}

/// The provider set chosen at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatModel>,
    pub tools: Arc<dyn ToolInvoker>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Run `f` on a worker thread and wait at most `deadline` for it.
///
/// Errors from `f` are reported as `kind` collaborator failures; a missed
/// deadline is `HarkError::Timeout`. The worker is detached on timeout and
/// its late result is discarded.
pub fn call_with_deadline<T, F>(kind: CollaboratorKind, deadline: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name(format!("hark-{kind}"))
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(deadline) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e @ HarkError::Collaborator { .. })) => Err(e),
        Ok(Err(e @ HarkError::Timeout { .. })) => Err(e),
        Ok(Err(e)) => Err(HarkError::collaborator(kind, e.to_string())),
        Err(RecvTimeoutError::Timeout) => Err(HarkError::timeout(format!("{kind} call"))),
        Err(RecvTimeoutError::Disconnected) => Err(HarkError::collaborator(
            kind,
            "worker exited without a result",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_returns_value_in_time() {
        let out = call_with_deadline(CollaboratorKind::Chat, Duration::from_secs(1), || Ok(42));
        assert_eq!(out.expect("value"), 42);
    }

    #[test]
    fn deadline_expires_as_timeout() {
        let out: Result<()> =
            call_with_deadline(CollaboratorKind::Synthesis, Duration::from_millis(20), || {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            });
        match out {
            Err(HarkError::Timeout { what }) => assert_eq!(what, "synthesis call"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn foreign_errors_are_tagged_with_the_kind() {
        let out: Result<()> = call_with_deadline(
            CollaboratorKind::Transcription,
            Duration::from_secs(1),
            || Err(HarkError::Other(anyhow::anyhow!("connection reset"))),
        );
        match out {
            Err(HarkError::Collaborator { kind, message }) => {
                assert_eq!(kind, CollaboratorKind::Transcription);
                assert!(message.contains("connection reset"));
            }
            other => panic!("expected collaborator error, got {other:?}"),
        }
    }

    #[test]
    fn panicking_worker_is_a_collaborator_failure() {
        let out: Result<()> =
            call_with_deadline(CollaboratorKind::Tool, Duration::from_secs(1), || {
                panic!("tool crashed")
            });
        assert!(matches!(out, Err(HarkError::Collaborator { .. })));
    }

    #[test]
    fn messages_serialize_without_empty_tool_fields() {
        let json = serde_json::to_value(Message::user("what time is it")).expect("serialize");
        assert_eq!(json["role"], "user");
        assert!(json.get("toolCalls").is_none());
        assert!(json.get("toolCallId").is_none());

        let tool = serde_json::to_value(Message::tool("call_1", "{}")).expect("serialize");
        assert_eq!(tool["toolCallId"], "call_1");
    }
}
