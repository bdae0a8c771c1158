//! Anthropic messages API as a chat model.

use hark_core::error::Result;
use hark_core::{ChatModel, ChatReply, CollaboratorKind, HarkError, Message, Role, ToolCall, ToolSpec};
use reqwest::blocking::Client;
use serde_json::{json, Map, Value};

use super::error_body;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicChat {
    pub fn new(client: Client, base_url: &str, api_key: String, model: &str, max_tokens: u32) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            max_tokens,
        }
    }
}

impl ChatModel for AnthropicChat {
    fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> Result<ChatReply> {
        let fail = |m: String| HarkError::collaborator(CollaboratorKind::Chat, m);

        let body = messages_request_body(&self.model, self.max_tokens, history, tools);
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .map_err(|e| fail(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(fail(error_body(resp)));
        }

        let value: Value = resp
            .json()
            .map_err(|e| fail(format!("response parse error: {e}")))?;
        parse_messages_response(&value)
    }
}

/// System messages are lifted into the top-level `system` field. Tool results
/// travel as `tool_result` blocks inside user messages, and consecutive
/// results share one message.
pub fn messages_request_body(
    model: &str,
    max_tokens: u32,
    history: &[Message],
    tools: &[ToolSpec],
) -> Value {
    let system: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let mut messages: Vec<Value> = Vec::new();
    for m in history {
        match m.role {
            Role::System => {}
            Role::User => messages.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for call in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": Value::Object(call.arguments.clone()),
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                });
                match messages.last_mut() {
                    Some(last) if is_tool_result_message(last) => {
                        if let Some(blocks) = last["content"].as_array_mut() {
                            blocks.push(block);
                        }
                    }
                    _ => messages.push(json!({ "role": "user", "content": [block] })),
                }
            }
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }
    if !tools.is_empty() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

fn is_tool_result_message(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .is_some_and(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
}

pub fn parse_messages_response(value: &Value) -> Result<ChatReply> {
    let blocks = value["content"].as_array().ok_or_else(|| {
        HarkError::collaborator(CollaboratorKind::Chat, "response has no content blocks")
    })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(t.trim());
                }
            }
            Some("tool_use") => {
                let arguments = match &block["input"] {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments,
                });
            }
            _ => {}
        }
    }

    Ok(ChatReply {
        text: text.trim().to_string(),
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        let mut arguments = Map::new();
        arguments.insert("city".into(), json!("Oslo"));
        ToolCall {
            id: id.into(),
            name: "weather".into(),
            arguments,
        }
    }

    #[test]
    fn system_prompt_is_lifted_out_of_messages() {
        let history = vec![Message::system("be brief"), Message::user("hello")];
        let body = messages_request_body("claude", 512, &history, &[]);

        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 512);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn consecutive_tool_results_share_one_user_message() {
        let history = vec![
            Message::user("weather in oslo and bergen"),
            Message::assistant("Checking.", vec![call("t1"), call("t2")]),
            Message::tool("t1", "rain"),
            Message::tool("t2", "sun"),
        ];
        let tools = vec![ToolSpec {
            name: "weather".into(),
            description: "Forecast".into(),
            input_schema: json!({ "type": "object" }),
        }];
        let body = messages_request_body("claude", 512, &history, &tools);

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);

        let assistant = messages[1]["content"].as_array().expect("blocks");
        assert_eq!(assistant[0]["type"], "text");
        assert_eq!(assistant[1]["type"], "tool_use");
        assert_eq!(assistant[2]["input"]["city"], "Oslo");

        let results = messages[2]["content"].as_array().expect("blocks");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["tool_use_id"], "t2");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let value = json!({
            "content": [
                { "type": "text", "text": "Let me look." },
                { "type": "tool_use", "id": "tu_1", "name": "weather", "input": { "city": "Oslo" } }
            ],
            "stop_reason": "tool_use"
        });
        let reply = parse_messages_response(&value).expect("reply");
        assert_eq!(reply.text, "Let me look.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id, "tu_1");
        assert_eq!(reply.tool_calls[0].arguments["city"], "Oslo");
    }

    #[test]
    fn missing_content_is_a_chat_failure() {
        assert!(parse_messages_response(&json!({ "type": "error" })).is_err());
    }
}
