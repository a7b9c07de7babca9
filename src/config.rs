//! Configuration loading and validation.
//!
//! Credentials come from the environment (`DISCORD_BOT_TOKEN`,
//! `OPENAI_API_KEY`, optional `OPENAI_BASE_URL`); everything else comes
//! from an optional TOML file with serde-defaulted sections, so a partial
//! file only overrides what it names.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Charbot configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discord connection and presence settings.
    pub discord: DiscordConfig,

    /// Completion API settings.
    pub llm: LlmConfig,

    /// Concurrency and history limits.
    pub limits: LimitsConfig,

    /// Client-side rate limiting.
    pub rate: RateLimitConfig,

    /// Connection health monitoring.
    pub health: HealthConfig,

    /// Persona library settings.
    pub personas: PersonaConfig,

    /// Channel-management tool calls.
    pub tools: ToolsConfig,
}

/// Discord connection and presence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token. Environment only; never read from the file.
    #[serde(skip)]
    pub token: String,

    /// Presence activity text shown while online.
    pub status_text: String,

    /// Message content that triggers the status report.
    pub status_command: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            status_text: "the conversation".to_string(),
            status_command: "!status".to_string(),
        }
    }
}

/// Completion API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key. Environment only; never read from the file.
    #[serde(skip)]
    pub api_key: String,

    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,

    /// Model name sent with every request.
    pub model: String,

    /// Completion token cap per request.
    pub max_completion_tokens: u32,

    /// Sampling temperature. Sent in the body only when it differs
    /// from 1.0.
    pub temperature: f32,

    /// Total per-request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Attempts per request for retriable failures.
    pub max_retries: u32,

    /// Linear backoff step between attempts, in milliseconds.
    pub retry_delay_ms: u64,

    /// Context budget; over-estimate jobs are rejected before submission.
    pub context_token_limit: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-5".to_string(),
            max_completion_tokens: 2000,
            temperature: 1.0,
            request_timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            context_token_limit: 125_000,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Concurrency and history limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// In-flight message cap; further work queues at the gate.
    pub max_concurrent_messages: usize,

    /// Age at which the reaper cancels an in-flight task, in seconds.
    pub message_timeout_seconds: u64,

    /// Reaper interval in seconds.
    pub cleanup_interval_seconds: u64,

    /// How many channel messages to fetch for context (platform caps
    /// this at 100).
    pub chat_history_limit: usize,

    /// Keep replying without a mention while the previous channel message
    /// is the bot's own and the new one mentions nobody else.
    pub continuous_conversation: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 15,
            message_timeout_seconds: 300,
            cleanup_interval_seconds: 300,
            chat_history_limit: 100,
            continuous_conversation: true,
        }
    }
}

impl LimitsConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Client-side rate limiting of outbound completion requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_period: u32,
    pub period_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_period: 50,
            period_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }
}

/// Connection health monitoring.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Background probe interval in seconds.
    pub check_interval_seconds: u64,

    /// Whether the background loop probes for recovery at all.
    pub auto_recovery: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            auto_recovery: true,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Persona library settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Directory of persona markdown files.
    pub dir: PathBuf,

    /// Persona used when none is requested or the requested one is
    /// missing.
    pub default_persona: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("personas"),
            default_persona: "friendly".to_string(),
        }
    }
}

/// Channel-management tool calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Master switch. When on, the message pipeline uses the
    /// non-streaming completion variant so tool directives can be read.
    pub enabled: bool,

    /// Tool names the model may call. Empty means none, even when
    /// enabled.
    pub allowed_operations: Vec<String>,

    /// Require the requesting member to be an admin.
    pub require_admin: bool,

    /// Role names that count as admin in addition to guild owners and
    /// members with the administrator permission.
    pub admin_roles: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_operations: Vec::new(),
            require_admin: true,
            admin_roles: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the environment with default tunables.
    pub fn load() -> Result<Self> {
        Self::default().finish()
    }

    /// Load tunables from a TOML file, then apply environment credentials
    /// and validate.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.discord.token = require_env("DISCORD_BOT_TOKEN")?;
        self.llm.api_key = require_env("OPENAI_API_KEY")?;
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.llm.base_url = base_url;
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Range checks on the tunables. Credentials are checked in `finish`
    /// so file-only parsing stays testable.
    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".to_string()).into());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            ))
            .into());
        }
        if self.llm.max_completion_tokens == 0 {
            return Err(ConfigError::Invalid(
                "llm.max_completion_tokens must be positive".to_string(),
            )
            .into());
        }
        if self.llm.max_retries == 0 {
            return Err(ConfigError::Invalid("llm.max_retries must be positive".to_string()).into());
        }
        if self.limits.max_concurrent_messages == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_concurrent_messages must be positive".to_string(),
            )
            .into());
        }
        if self.limits.chat_history_limit == 0 || self.limits.chat_history_limit > 100 {
            return Err(ConfigError::Invalid(format!(
                "limits.chat_history_limit must be within 1..=100, got {}",
                self.limits.chat_history_limit
            ))
            .into());
        }
        if self.rate.requests_per_period == 0 || self.rate.period_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate.requests_per_period and rate.period_seconds must be positive".to_string(),
            )
            .into());
        }
        if self.personas.default_persona.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "personas.default_persona must not be empty".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

fn require_env(key: &'static str) -> std::result::Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.limits.max_concurrent_messages, 15);
        assert_eq!(config.limits.message_timeout_seconds, 300);
        assert_eq!(config.limits.cleanup_interval_seconds, 300);
        assert_eq!(config.limits.chat_history_limit, 100);
        assert!(config.limits.continuous_conversation);
        assert_eq!(config.rate.requests_per_period, 50);
        assert_eq!(config.rate.period_seconds, 60);
        assert_eq!(config.llm.max_completion_tokens, 2000);
        assert_eq!(config.llm.temperature, 1.0);
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.llm.context_token_limit, 125_000);
        assert_eq!(config.health.check_interval_seconds, 60);
        assert!(!config.tools.enabled);
        assert!(config.tools.require_admin);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let raw = indoc! {r#"
            [limits]
            max_concurrent_messages = 4
            continuous_conversation = false

            [llm]
            model = "gpt-4o-mini"
            temperature = 0.7
        "#};
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.limits.max_concurrent_messages, 4);
        assert!(!config.limits.continuous_conversation);
        assert_eq!(config.limits.chat_history_limit, 100);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.temperature, 0.7);
        assert_eq!(config.llm.max_completion_tokens, 2000);
        assert_eq!(config.rate.requests_per_period, 50);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.llm.temperature = 9.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.chat_history_limit = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_concurrent_messages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_never_come_from_the_file() {
        let raw = indoc! {r#"
            [discord]
            token = "file-token"
            status_text = "the stars"

            [llm]
            api_key = "file-key"
        "#};
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.discord.token.is_empty());
        assert!(config.llm.api_key.is_empty());
        assert_eq!(config.discord.status_text, "the stars");
    }
}
