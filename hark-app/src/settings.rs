//! Persistent application settings (JSON file in the user data directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use hark_core::AssistantConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

const DEFAULT_EXCLUDED_DEVICE_KEYWORDS: &[&str] =
    &["blackhole", "virtual", "loopback", "microsoft teams"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    OpenAi,
    Anthropic,
}

/// One stdio tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ToolServerSettings {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub enabled: bool,
}

impl Default for ToolServerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub provider: ChatProvider,
    pub chat_model: String,
    pub transcription_model: String,
    pub speech_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    /// Tokens per Anthropic reply.
    pub max_reply_tokens: u32,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Devices whose names contain one of these are never picked automatically.
    pub excluded_device_keywords: Vec<String>,
    pub tool_servers: Vec<ToolServerSettings>,
    pub assistant: AssistantConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: ChatProvider::OpenAi,
            chat_model: "gpt-4o-mini".into(),
            transcription_model: "whisper-1".into(),
            speech_model: "tts-1".into(),
            openai_api_key: None,
            anthropic_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.into(),
            anthropic_base_url: DEFAULT_ANTHROPIC_BASE_URL.into(),
            max_reply_tokens: 1024,
            preferred_input_device: None,
            preferred_output_device: None,
            excluded_device_keywords: DEFAULT_EXCLUDED_DEVICE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            tool_servers: Vec::new(),
            assistant: AssistantConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.chat_model = self.chat_model.trim().to_string();
        if self.chat_model.is_empty() {
            self.chat_model = default_chat_model(self.provider).into();
        }
        self.transcription_model = non_empty_or(&self.transcription_model, "whisper-1");
        self.speech_model = non_empty_or(&self.speech_model, "tts-1");
        self.openai_api_key = normalize_optional(&self.openai_api_key);
        self.anthropic_api_key = normalize_optional(&self.anthropic_api_key);
        self.openai_base_url = normalize_base_url(&self.openai_base_url, DEFAULT_OPENAI_BASE_URL);
        self.anthropic_base_url =
            normalize_base_url(&self.anthropic_base_url, DEFAULT_ANTHROPIC_BASE_URL);
        self.max_reply_tokens = self.max_reply_tokens.clamp(64, 8192);
        self.preferred_input_device = normalize_optional(&self.preferred_input_device);
        self.preferred_output_device = normalize_optional(&self.preferred_output_device);
        self.excluded_device_keywords = normalize_keywords(&self.excluded_device_keywords);
        self.tool_servers
            .retain(|s| !s.name.trim().is_empty() && !s.command.trim().is_empty());

        let session = &mut self.assistant.session;
        session.voice = non_empty_or(&session.voice, "nova");
        session.cooldown_secs = session.cooldown_secs.clamp(0.0, 300.0);
        session.collaborator_timeout_secs = session.collaborator_timeout_secs.clamp(1.0, 300.0);
        session.max_tool_rounds = session.max_tool_rounds.min(16);
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = first_env(&["HARK_OPENAI_API_KEY", "OPENAI_API_KEY"]) {
            self.openai_api_key = Some(key);
        }
        if let Some(key) = first_env(&["HARK_ANTHROPIC_API_KEY", "ANTHROPIC_API_KEY"]) {
            self.anthropic_api_key = Some(key);
        }
    }
}

pub fn default_chat_model(provider: ChatProvider) -> &'static str {
    match provider {
        ChatProvider::OpenAi => "gpt-4o-mini",
        ChatProvider::Anthropic => "claude-3-5-haiku-latest",
    }
}

fn non_empty_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.into()
    } else {
        trimmed.into()
    }
}

fn normalize_optional(raw: &Option<String>) -> Option<String> {
    raw.as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_base_url(raw: &str, fallback: &str) -> String {
    non_empty_or(raw, fallback).trim_end_matches('/').to_string()
}

fn normalize_keywords(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in raw {
        let k = keyword.trim().to_ascii_lowercase();
        if k.is_empty() || out.contains(&k) {
            continue;
        }
        out.push(k);
    }
    out
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// `HARK_SETTINGS` if set, otherwise the platform data directory.
pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("HARK_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Hark")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("hark")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "settings file is invalid, using defaults: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let raw = r#"{
            "provider": "anthropic",
            "chatModel": "  ",
            "excludedDeviceKeywords": ["Virtual", "virtual", " "],
            "assistant": { "session": { "cooldown_secs": 4.0 } }
        }"#;
        let mut s: AppSettings = serde_json::from_str(raw).expect("parse");
        s.normalize();
        assert_eq!(s.provider, ChatProvider::Anthropic);
        assert_eq!(s.chat_model, "claude-3-5-haiku-latest");
        assert_eq!(s.excluded_device_keywords, vec!["virtual".to_string()]);
        assert_eq!(s.transcription_model, "whisper-1");
        assert!((s.assistant.session.cooldown_secs - 4.0).abs() < f32::EPSILON);
        assert_eq!(s.assistant.wake.phrases.len(), 5);
    }

    #[test]
    fn normalize_trims_and_clamps() {
        let mut s = AppSettings {
            openai_api_key: Some("  ".into()),
            openai_base_url: "https://proxy.local/v1/".into(),
            max_reply_tokens: 5,
            tool_servers: vec![
                ToolServerSettings {
                    name: "clock".into(),
                    command: "clock-server".into(),
                    ..Default::default()
                },
                ToolServerSettings::default(),
            ],
            ..Default::default()
        };
        s.normalize();
        assert_eq!(s.openai_api_key, None);
        assert_eq!(s.openai_base_url, "https://proxy.local/v1");
        assert_eq!(s.max_reply_tokens, 64);
        assert_eq!(s.tool_servers.len(), 1);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let mut s = AppSettings::default();
        s.preferred_input_device = Some("USB Mic".into());
        save_settings(&path, &s).expect("save");

        let loaded = load_settings(&path);
        assert_eq!(loaded.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(loaded.provider, ChatProvider::OpenAi);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        let loaded = load_settings(&path);
        assert_eq!(loaded.chat_model, "gpt-4o-mini");
    }
}
