use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mcp::TransportMode;
use crate::util::{env_non_empty, is_http_url};

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_APP_TITLE: &str = "chatloop";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 20;
pub const DEFAULT_STREAM_UPDATE_EVERY: usize = 6;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

pub const SETTINGS_KEY_API_KEY: &str = "api_key";
pub const SETTINGS_KEY_MODEL: &str = "model";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tool_rounds: usize,
    pub stream_update_every: usize,
    pub tool_timeout_secs: u64,
    pub mcp_url: Option<String>,
    pub mcp_transport: TransportMode,
    pub app_title: String,
    pub app_referer: Option<String>,
    pub settings_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            stream_update_every: DEFAULT_STREAM_UPDATE_EVERY,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            mcp_url: None,
            mcp_transport: TransportMode::Auto,
            app_title: DEFAULT_APP_TITLE.to_string(),
            app_referer: None,
            settings_path: default_settings_path(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let settings_path = env_non_empty("CHATLOOP_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_settings_path);
        let settings = SettingsStore::open(&settings_path)?;

        let api_key = env_non_empty("CHATLOOP_API_KEY")
            .or_else(|| env_non_empty("OPENROUTER_API_KEY"))
            .or_else(|| settings.get(SETTINGS_KEY_API_KEY).map(str::to_string));
        let model = env_non_empty("CHATLOOP_MODEL")
            .or_else(|| settings.get(SETTINGS_KEY_MODEL).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_url = env_non_empty("CHATLOOP_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let mcp_transport = match env_non_empty("CHATLOOP_MCP_TRANSPORT") {
            Some(value) => TransportMode::parse(&value)
                .with_context(|| format!("Invalid CHATLOOP_MCP_TRANSPORT '{value}'"))?,
            None => TransportMode::Auto,
        };

        Ok(Self {
            api_key,
            api_url,
            model,
            system_prompt: env_non_empty("CHATLOOP_SYSTEM_PROMPT"),
            max_tool_rounds: parse_clamped("CHATLOOP_MAX_TOOL_ROUNDS", 1, 100)
                .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS),
            stream_update_every: parse_clamped("CHATLOOP_STREAM_UPDATE_EVERY", 1, 64)
                .unwrap_or(DEFAULT_STREAM_UPDATE_EVERY),
            tool_timeout_secs: parse_clamped("CHATLOOP_TOOL_TIMEOUT_SECS", 1, 3_600)
                .map(|v| v as u64)
                .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
            mcp_url: env_non_empty("CHATLOOP_MCP_URL"),
            mcp_transport,
            app_title: env_non_empty("CHATLOOP_APP_TITLE")
                .unwrap_or_else(|| DEFAULT_APP_TITLE.to_string()),
            app_referer: env_non_empty("CHATLOOP_APP_REFERER"),
            settings_path,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.api_url) {
            bail!(
                "Invalid CHATLOOP_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if let Some(mcp_url) = &self.mcp_url {
            if !is_http_url(mcp_url) {
                bail!("Invalid CHATLOOP_MCP_URL '{mcp_url}': expected http:// or https:// URL");
            }
        }

        if self.model.trim().is_empty() {
            bail!("Model id must not be empty");
        }

        if self.max_tool_rounds == 0 {
            bail!("max_tool_rounds must be at least 1");
        }

        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn parse_clamped(key: &str, min: usize, max: usize) -> Option<usize> {
    env_non_empty(key)
        .and_then(|v| v.parse::<usize>().ok())
        .map(|v| v.clamp(min, max))
}

pub fn default_settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".chatloop").join("settings.json")
}

/// String key/value settings persisted as a single JSON object file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl SettingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid settings file {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.values)?;
        fs::write(&self.path, body)
            .with_context(|| format!("Failed to write settings {}", self.path.display()))
    }
}
