//! Error types for charbot.
//!
//! Each subsystem gets its own error enum; the top-level [`Error`] wraps
//! them transparently so call sites can use the crate-wide [`Result`]
//! alias and `?` without manual conversion.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Completion request lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// The prompt's token estimate exceeds the context limit. Raised
    /// before any network activity; the job is rejected, never trimmed.
    #[error("context too large: estimated {estimated} tokens, limit {limit}")]
    ContextTooLarge { estimated: usize, limit: usize },

    /// The connection health check reported the API as unusable.
    #[error("completion API is unavailable (connection {status})")]
    Degraded { status: &'static str },

    /// 429 responses exhausted the retry budget.
    #[error("rate limited by the completion API after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Terminal non-2xx response. Not retried.
    #[error("completion API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Request timeouts exhausted the retry budget.
    #[error("completion request timed out after {attempts} attempts")]
    TimedOut { attempts: u32 },

    /// Transport-level failure (connect, TLS, mid-body) that exhausted
    /// retries or occurred after streaming had begun.
    #[error("completion transport error: {0}")]
    Transport(String),

    /// The event stream ended or broke before a terminal marker.
    #[error("completion stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompletionError {
    /// Short tag for health bookkeeping and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContextTooLarge { .. } => "context_too_large",
            Self::Degraded { .. } => "degraded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Api { .. } => "api_error",
            Self::TimedOut { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::Stream(_) => "stream",
            Self::Other(_) => "other",
        }
    }
}

/// Messaging platform errors. Expected races (deleted messages, missing
/// permissions, edit throttling) are modeled as outcome variants on the
/// platform trait, not as errors; these cover transport and misuse.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform adapter has not been started")]
    NotStarted,

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("platform API error: {0}")]
    Api(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persona library errors.
#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("failed to read persona file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("persona {0:?} failed validation: {1}")]
    Invalid(String, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
