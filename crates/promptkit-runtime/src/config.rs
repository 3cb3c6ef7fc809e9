//! Process configuration, loaded from environment variables (`dotenvy` loads
//! an optional `.env` first), following the teacher's `RunnerConfig::from_env`
//! convention: every tunable has a default, nothing required is silently
//! assumed, and constructing a `Config` never itself fails — missing secrets
//! only surface once something tries to use them.

use std::time::Duration;

use promptkit_core::stages::provider::ToolPolicy;

/// Which provider adapter to construct from `Config::provider_api_key`/
/// `Config::provider_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    fn from_env_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }
}

/// Top-level process configuration: everything `promptkit-runtime`'s binary
/// and the `ConversationOrchestrator` need, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,

    pub provider_kind: ProviderKind,
    pub provider_api_key: Option<String>,
    pub provider_model: String,
    pub provider_base_url: Option<String>,

    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerSettings,

    pub tool_max_calls_per_turn: usize,
}

impl Config {
    /// Loads `.env` if present (ignoring a missing file; any other I/O error
    /// still surfaces) then reads every variable below with a default:
    ///
    /// `DATABASE_URL`, `PROMPTKIT_PROVIDER` (`openai`|`anthropic`, default
    /// `openai`), `OPENAI_API_KEY`/`ANTHROPIC_API_KEY`, `PROMPTKIT_MODEL`,
    /// `PROMPTKIT_PROVIDER_BASE_URL`, `PROMPTKIT_MAX_CONCURRENT`,
    /// `PROMPTKIT_REQUEST_TIMEOUT_SECS`, `PROMPTKIT_SHUTDOWN_TIMEOUT_SECS`,
    /// `PROMPTKIT_STREAM_BUFFER_SIZE`, `PROMPTKIT_TOOL_MAX_CALLS_PER_TURN`,
    /// plus the retry/circuit-breaker variables documented on
    /// `RetryConfig`/`CircuitBreakerSettings`.
    pub fn from_env() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let provider_kind = env_var("PROMPTKIT_PROVIDER")
            .and_then(|v| ProviderKind::from_env_str(&v))
            .unwrap_or(ProviderKind::OpenAi);

        let provider_api_key = match provider_kind {
            ProviderKind::OpenAi => env_var("OPENAI_API_KEY"),
            ProviderKind::Anthropic => env_var("ANTHROPIC_API_KEY"),
        };

        let provider_model = env_var("PROMPTKIT_MODEL").unwrap_or_else(|| match provider_kind {
            ProviderKind::OpenAi => "gpt-4o".to_string(),
            ProviderKind::Anthropic => "claude-3-5-sonnet-20241022".to_string(),
        });

        Ok(Self {
            database_url: env_var("DATABASE_URL"),
            provider_kind,
            provider_api_key,
            provider_model,
            provider_base_url: env_var("PROMPTKIT_PROVIDER_BASE_URL"),
            orchestrator: OrchestratorConfig::from_env(),
            retry: RetryConfig::from_env(),
            circuit_breaker: CircuitBreakerSettings::from_env(),
            tool_max_calls_per_turn: env_var("PROMPTKIT_TOOL_MAX_CALLS_PER_TURN")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
        })
    }

    pub fn tool_policy(&self) -> ToolPolicy {
        ToolPolicy {
            max_tool_calls_per_turn: self.tool_max_calls_per_turn,
            ..ToolPolicy::default()
        }
    }
}

/// Configuration the spec names directly on the conversation orchestrator
/// (spec.md §4.9): concurrency ceiling, per-request timeout, graceful
/// shutdown timeout, streaming buffer size.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub stream_buffer_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            stream_buffer_size: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent: env_var("PROMPTKIT_MAX_CONCURRENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_concurrent),
            request_timeout: env_var("PROMPTKIT_REQUEST_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.request_timeout),
            shutdown_timeout: env_var("PROMPTKIT_SHUTDOWN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_timeout),
            stream_buffer_size: env_var("PROMPTKIT_STREAM_BUFFER_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.stream_buffer_size),
        }
    }
}

/// Mirrors the teacher's `RetryPolicy` field names so the env-var surface
/// reads the same way; converted into `crate::reliability::RetryPolicy` at
/// construction time.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_attempts: env_var("PROMPTKIT_RETRY_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_attempts),
            initial_interval: env_var("PROMPTKIT_RETRY_INITIAL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.initial_interval),
            max_interval: env_var("PROMPTKIT_RETRY_MAX_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.max_interval),
            backoff_coefficient: env_var("PROMPTKIT_RETRY_BACKOFF_COEFFICIENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.backoff_coefficient),
            jitter: env_var("PROMPTKIT_RETRY_JITTER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.jitter),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            failure_threshold: env_var("PROMPTKIT_CIRCUIT_FAILURE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.failure_threshold),
            success_threshold: env_var("PROMPTKIT_CIRCUIT_SUCCESS_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.success_threshold),
            reset_timeout: env_var("PROMPTKIT_CIRCUIT_RESET_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.reset_timeout),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_config_defaults_match_spec() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.stream_buffer_size, 100);
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(ProviderKind::from_env_str("OpenAI"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::from_env_str("anthropic"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::from_env_str("bogus"), None);
    }
}
