use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "parley.toml";
/// Telegram caps `getUpdates` batches at 100.
pub const MAX_POLL_LIMIT: u8 = 100;
/// Longest server-side wait Telegram honours for a long poll.
pub const MAX_POLL_TIMEOUT_SECS: u32 = 100;
/// A cursor older than this (7 days) is treated as rotated.
pub const DEFAULT_RESET_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level config (parley.toml + PARLEY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_commands")]
    pub commands: Vec<CommandConfig>,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            assistant: AssistantConfig::default(),
            dispatch: DispatchConfig::default(),
            network: NetworkConfig::default(),
            commands: default_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Maximum number of updates per `getUpdates` call (1..=100).
    #[serde(default = "default_poll_limit")]
    pub poll_limit: u8,
    /// Server-side long-poll wait in seconds (0..=100).
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u32,
    /// Staleness after which the offset cursor accepts any id as a new baseline.
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,
    #[serde(default = "default_allowed_updates")]
    pub allowed_updates: Vec<AllowedUpdate>,
    /// Push the local command menu to Telegram at startup when it differs.
    #[serde(default = "bool_true")]
    pub sync_commands: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_limit: default_poll_limit(),
            poll_timeout_secs: default_poll_timeout_secs(),
            reset_window_secs: default_reset_window_secs(),
            allowed_updates: default_allowed_updates(),
            sync_commands: true,
        }
    }
}

impl TelegramConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.poll_timeout_secs))
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }
}

/// Update kinds requested from the long-poll feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllowedUpdate {
    Message,
    EditedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_assistant_name")]
    pub name: String,
    pub instructions: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upload `files_dir` into a vector store and enable `file_search`.
    #[serde(default)]
    pub ingest_files: bool,
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
    #[serde(default = "default_vector_store_name")]
    pub vector_store_name: String,
    #[serde(default = "default_run_poll_interval_ms")]
    pub run_poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub citations: CitationStyle,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_model(),
            name: default_assistant_name(),
            instructions: None,
            temperature: default_temperature(),
            ingest_files: false,
            files_dir: default_files_dir(),
            vector_store_name: default_vector_store_name(),
            run_poll_interval_ms: default_run_poll_interval_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            citations: CitationStyle::default(),
        }
    }
}

impl AssistantConfig {
    pub fn run_poll_interval(&self) -> Duration {
        Duration::from_millis(self.run_poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// How citation annotations in assistant replies are rendered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CitationStyle {
    /// Remove the marker entirely.
    #[default]
    Strip,
    /// Replace the marker with `[filename]` of the cited file.
    Filename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pause between two cycles of one conversation handler.
    #[serde(default = "default_handler_interval_ms")]
    pub handler_interval_ms: u64,
    /// A handler with nothing to do for this long releases its chat slot.
    #[serde(default = "default_handler_idle_secs")]
    pub handler_idle_secs: u64,
    /// How long shutdown waits for in-flight work before aborting handlers.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Period of the debug-mode task report.
    #[serde(default = "default_state_log_secs")]
    pub state_log_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_interval_ms: default_handler_interval_ms(),
            handler_idle_secs: default_handler_idle_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            state_log_secs: default_state_log_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn handler_interval(&self) -> Duration {
        Duration::from_millis(self.handler_interval_ms)
    }

    pub fn handler_idle(&self) -> Duration {
        Duration::from_secs(self.handler_idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn state_log_period(&self) -> Duration {
        Duration::from_secs(self.state_log_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Outbound proxy for both the Telegram and the OpenAI clients.
    pub proxy: Option<String>,
}

/// A chat command answered with a fixed reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandConfig {
    pub name: String,
    pub description: Option<String>,
    pub reply: String,
}

fn bool_true() -> bool {
    true
}
fn default_poll_limit() -> u8 {
    MAX_POLL_LIMIT
}
fn default_poll_timeout_secs() -> u32 {
    MAX_POLL_TIMEOUT_SECS
}
fn default_reset_window_secs() -> u64 {
    DEFAULT_RESET_WINDOW_SECS
}
fn default_allowed_updates() -> Vec<AllowedUpdate> {
    vec![AllowedUpdate::Message, AllowedUpdate::EditedMessage]
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_assistant_name() -> String {
    "Startup HR Assistant".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_files_dir() -> String {
    "files".to_string()
}
fn default_vector_store_name() -> String {
    "Info".to_string()
}
fn default_run_poll_interval_ms() -> u64 {
    500
}
fn default_run_timeout_secs() -> u64 {
    300
}
fn default_handler_interval_ms() -> u64 {
    1000
}
fn default_handler_idle_secs() -> u64 {
    600
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_state_log_secs() -> u64 {
    60
}
fn default_commands() -> Vec<CommandConfig> {
    vec![
        CommandConfig {
            name: "start".to_string(),
            description: Some("Let me greet you.".to_string()),
            reply: "Hi".to_string(),
        },
        CommandConfig {
            name: "help".to_string(),
            description: Some("See what I can help you with.".to_string()),
            reply: "Ask me anything you want to know and I will look it up for you.".to_string(),
        },
    ]
}

impl ParleyConfig {
    /// Load config from a TOML file with PARLEY_* env var overrides.
    ///
    /// The file is `config_path` when given, `./parley.toml` otherwise; a
    /// missing file is not an error. Nested keys use `__` in env vars
    /// (`PARLEY_TELEGRAM__BOT_TOKEN`). Credentials still empty afterwards are
    /// taken from `TELEGRAM_BOT_TOKEN`, `OPENAI_API_KEY` and `HTTP_PROXY`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);

        let mut config: ParleyConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PARLEY_").split("__"))
            .extract()
            .map_err(|e| ParleyError::Config(e.to_string()))?;

        config.apply_env_fallbacks();
        Ok(config)
    }

    fn apply_env_fallbacks(&mut self) {
        if self.telegram.bot_token.is_empty() {
            if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
                self.telegram.bot_token = token;
            }
        }
        if self.assistant.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.assistant.api_key = key;
            }
        }
        if self.network.proxy.is_none() {
            self.network.proxy = std::env::var("HTTP_PROXY").ok().filter(|p| !p.is_empty());
        }
    }

    /// Reject configurations the process cannot serve with.
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ParleyError::MissingCredential {
                name: "telegram.bot_token",
            });
        }
        if self.assistant.api_key.trim().is_empty() {
            return Err(ParleyError::MissingCredential {
                name: "assistant.api_key",
            });
        }
        if self.telegram.poll_limit == 0 || self.telegram.poll_limit > MAX_POLL_LIMIT {
            return Err(ParleyError::Config(format!(
                "telegram.poll_limit must be within 1..={MAX_POLL_LIMIT}, got {}",
                self.telegram.poll_limit
            )));
        }
        if self.telegram.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS {
            return Err(ParleyError::Config(format!(
                "telegram.poll_timeout_secs must be at most {MAX_POLL_TIMEOUT_SECS}, got {}",
                self.telegram.poll_timeout_secs
            )));
        }
        if self.telegram.allowed_updates.is_empty() {
            return Err(ParleyError::Config(
                "telegram.allowed_updates must name at least one update kind".to_string(),
            ));
        }
        if self.assistant.run_poll_interval_ms == 0 {
            return Err(ParleyError::Config(
                "assistant.run_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
