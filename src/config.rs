use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::listeners::ListenerConfig;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Openrouter,
    Ollama,
    Openai,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Openrouter => write!(f, "openrouter"),
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Openai => write!(f, "openai"),
        }
    }
}

/// Settings for the reply engine: where its rules live and which model answers.
#[derive(Debug, Deserialize, Clone)]
pub struct BrainConfig {
    #[serde(default = "default_rules_dir")]
    pub rules_directory: PathBuf,
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl BrainConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the canonical URL for the configured provider.
    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.is_empty() {
            return &self.base_url;
        }
        match self.provider {
            LlmProvider::Openrouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
            LlmProvider::Openai => "https://api.openai.com/v1",
        }
    }
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            rules_directory: default_rules_dir(),
            provider: LlmProvider::default(),
            model: default_model(),
            base_url: String::new(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminsConfig {
    /// File the admin list is persisted to after every change
    #[serde(default = "default_admins_path")]
    pub path: PathBuf,
    /// Seeds the admin list when the file does not exist yet
    #[serde(default)]
    pub initial: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_config")]
    pub database: DatabaseConfig,
    #[serde(default = "default_admins_config")]
    pub admins: AdminsConfig,
    #[serde(default)]
    pub brain: BrainConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("brain")
}

fn default_model() -> String {
    "moonshotai/kimi-k2.5".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_system_prompt() -> String {
    "You are Scarecrow, a friendly chat bot. \
     Keep your replies short and conversational."
        .to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_db_path() -> PathBuf {
    PathBuf::from("scarecrow.db")
}

fn default_admins_path() -> PathBuf {
    PathBuf::from("admins.toml")
}

fn default_database_config() -> DatabaseConfig {
    DatabaseConfig {
        path: default_db_path(),
    }
}

fn default_admins_config() -> AdminsConfig {
    AdminsConfig {
        path: default_admins_path(),
        initial: Vec::new(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Listener registrations that are switched on, in file order.
    pub fn enabled_listeners(&self) -> impl Iterator<Item = &ListenerConfig> {
        self.listeners.iter().filter(|l| l.enabled)
    }
}
