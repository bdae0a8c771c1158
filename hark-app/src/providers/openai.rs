//! OpenAI audio and chat-completions endpoints over a blocking client.

use hark_core::error::Result;
use hark_core::{
    ChatModel, ChatReply, CollaboratorKind, HarkError, Message, Role, Synthesizer, ToolCall,
    ToolSpec, Transcriber,
};
use reqwest::blocking::{multipart, Client};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::error_body;

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    transcription_model: String,
    speech_model: String,
}

impl OpenAiClient {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: String,
        chat_model: &str,
        transcription_model: &str,
        speech_model: &str,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: chat_model.into(),
            transcription_model: transcription_model.into(),
            speech_model: speech_model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

impl Transcriber for OpenAiClient {
    fn transcribe(&self, wav: &[u8], language: Option<&str>) -> Result<String> {
        let fail = |m: String| HarkError::collaborator(CollaboratorKind::Transcription, m);

        let file = multipart::Part::bytes(wav.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| fail(format!("MIME error: {e}")))?;
        let mut form = multipart::Form::new()
            .part("file", file)
            .text("model", self.transcription_model.clone())
            .text("response_format", "json");
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let resp = self
            .client
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| fail(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(fail(error_body(resp)));
        }

        let body: Value = resp
            .json()
            .map_err(|e| fail(format!("response parse error: {e}")))?;
        let text = body["text"].as_str().unwrap_or("").trim().to_string();
        debug!(chars = text.len(), "transcription received");
        Ok(text)
    }
}

impl ChatModel for OpenAiClient {
    fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<ChatReply> {
        let fail = |m: String| HarkError::collaborator(CollaboratorKind::Chat, m);

        let body = chat_request_body(&self.chat_model, history, tools);
        let resp = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| fail(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(fail(error_body(resp)));
        }

        let value: Value = resp
            .json()
            .map_err(|e| fail(format!("response parse error: {e}")))?;
        parse_chat_response(&value)
    }
}

impl Synthesizer for OpenAiClient {
    fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let fail = |m: String| HarkError::collaborator(CollaboratorKind::Synthesis, m);

        let body = json!({
            "model": self.speech_model,
            "input": text,
            "voice": voice,
            "response_format": "wav",
        });
        let resp = self
            .client
            .post(self.url("audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| fail(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(fail(error_body(resp)));
        }

        let bytes = resp
            .bytes()
            .map_err(|e| fail(format!("failed to read audio: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Chat-completions request in the function-calling format.
pub fn chat_request_body(model: &str, history: &[Message], tools: &[ToolSpec]) -> Value {
    let messages: Vec<Value> = history.iter().map(message_json).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !tools.is_empty() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

fn message_json(m: &Message) -> Value {
    match m.role {
        Role::System => json!({ "role": "system", "content": m.content }),
        Role::User => json!({ "role": "user", "content": m.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if m.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": m.content })
        }
        Role::Assistant => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            // The API wants the arguments as a JSON string.
                            "arguments": Value::Object(c.arguments.clone()).to_string(),
                        }
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
    }
}

pub fn parse_chat_response(value: &Value) -> Result<ChatReply> {
    let fail = |m: &str| HarkError::collaborator(CollaboratorKind::Chat, m);

    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| fail("response has no choices"))?;
    let text = message["content"].as_str().unwrap_or("").trim().to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let id = call["id"].as_str().unwrap_or("").to_string();
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| fail("tool call without a function name"))?
                .to_string();
            let raw = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            tool_calls.push(ToolCall {
                id,
                name,
                arguments: parse_arguments(raw),
            });
        }
    }

    Ok(ChatReply { text, tool_calls })
}

/// Malformed or non-object arguments become an empty map; the tool reports
/// what it is missing.
fn parse_arguments(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
