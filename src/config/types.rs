//! Configuration data model.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial (or
//! empty) `steward.toml` is valid and falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::{
    DEFAULT_API_BASE_URL, DEFAULT_API_KEY_ENV, DEFAULT_MAX_FOLLOWUP_TURNS,
    DEFAULT_MAX_MESSAGE_CHARS, DEFAULT_MODEL_ID, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_SYSTEM_PROMPT, DEFAULT_TURN_TIMEOUT_SECS,
};
use crate::operation::ChatMode;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    pub display: DisplayConfig,
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    /// Inline key. Prefer `api_key_env` for anything shared.
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    pub api_key_env: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: String::new(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
            model: DEFAULT_MODEL_ID.to_string(),
            temperature: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Turn loop and policy settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Mode given to chats created without an explicit one.
    pub default_mode: ChatMode,
    /// Extra model turns allowed after every operation of a turn concluded.
    pub max_followup_turns: u32,
    /// Wall-clock ceiling for one orchestrator run.
    pub turn_timeout_secs: u64,
    /// Operation messages longer than this are truncated and stashed.
    pub max_message_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_mode: ChatMode::Read,
            max_followup_turns: DEFAULT_MAX_FOLLOWUP_TURNS,
            turn_timeout_secs: DEFAULT_TURN_TIMEOUT_SECS,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

/// Where chats and records live, and which directory file operations see.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the platform data dir (`.../steward`).
    pub root: Option<PathBuf>,
    pub workspace: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            workspace: PathBuf::from("."),
        }
    }
}

impl StorageConfig {
    pub fn resolved_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("steward"))
                .unwrap_or_else(|| PathBuf::from(".steward"))
        })
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.resolved_root().join("chats")
    }

    pub fn records_path(&self) -> PathBuf {
        self.resolved_root().join("records.json")
    }

    pub fn stash_path(&self) -> PathBuf {
        self.resolved_root().join("stash.json")
    }
}

/// Terminal output settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub color: bool,
    pub show_tokens: bool,
    pub show_reasoning: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            color: true,
            show_tokens: false,
            show_reasoning: false,
        }
    }
}

/// Outcome of writing the config template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigInitResult {
    Created { path: PathBuf },
    AlreadyInitialized { path: PathBuf },
    Overwritten { path: PathBuf },
}
