//! HTTP-backed collaborators.
//!
//! Speech in both directions always goes through the OpenAI audio endpoints;
//! the chat model is either OpenAI or Anthropic depending on settings.

pub mod anthropic;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use hark_core::{ChatModel, Collaborators, ToolInvoker};
use reqwest::blocking::Client;
use tracing::info;

use crate::settings::{AppSettings, ChatProvider};

use self::anthropic::AnthropicChat;
use self::openai::OpenAiClient;

/// The HTTP timeout sits a little past the collaborator deadline so the
/// session reports the timeout, not reqwest.
pub fn http_client(settings: &AppSettings) -> anyhow::Result<Client> {
    let deadline = settings.assistant.session.collaborator_timeout();
    Client::builder()
        .timeout(deadline + Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("hark/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Must run outside an async context: the blocking client owns a runtime.
pub fn build_collaborators(
    settings: &AppSettings,
    tools: Arc<dyn ToolInvoker>,
) -> anyhow::Result<Collaborators> {
    let Some(openai_key) = settings.openai_api_key.clone() else {
        bail!("an OpenAI API key is required for transcription and speech (set OPENAI_API_KEY)");
    };
    let client = http_client(settings)?;

    let openai = Arc::new(OpenAiClient::new(
        client.clone(),
        &settings.openai_base_url,
        openai_key,
        &settings.chat_model,
        &settings.transcription_model,
        &settings.speech_model,
    ));

    let chat: Arc<dyn ChatModel> = match settings.provider {
        ChatProvider::OpenAi => openai.clone(),
        ChatProvider::Anthropic => {
            let Some(key) = settings.anthropic_api_key.clone() else {
                bail!("provider is anthropic but no API key is set (ANTHROPIC_API_KEY)");
            };
            Arc::new(AnthropicChat::new(
                client,
                &settings.anthropic_base_url,
                key,
                &settings.chat_model,
                settings.max_reply_tokens,
            ))
        }
    };

    info!(
        provider = ?settings.provider,
        chat_model = %settings.chat_model,
        tools = tools.tools().len(),
        "collaborators ready"
    );

    Ok(Collaborators {
        transcriber: openai.clone(),
        chat,
        tools,
        synthesizer: openai,
    })
}

/// Body of a failed response, trimmed for logs.
pub(crate) fn error_body(resp: reqwest::blocking::Response) -> String {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    let body = body.trim();
    if body.len() > 300 {
        let mut cut = 300;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{status}: {}...", &body[..cut])
    } else {
        format!("{status}: {body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hark_core::NoTools;

    #[test]
    fn missing_openai_key_is_reported() {
        let settings = AppSettings::default();
        let err = build_collaborators(&settings, Arc::new(NoTools))
            .err()
            .expect("no key");
        assert!(err.to_string().contains("OpenAI API key"));
    }

    #[test]
    fn anthropic_provider_needs_its_own_key() {
        let mut settings = AppSettings::default();
        settings.provider = ChatProvider::Anthropic;
        settings.openai_api_key = Some("sk-test".into());
        let err = build_collaborators(&settings, Arc::new(NoTools))
            .err()
            .expect("no anthropic key");
        assert!(err.to_string().contains("anthropic"));
    }
}
