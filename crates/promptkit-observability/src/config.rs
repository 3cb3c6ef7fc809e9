//! Observability configuration, loaded from environment variables.

use std::env;

/// Configuration for observability integrations.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Whether observability is enabled globally. The `TracingBackend` is
    /// always on regardless of this flag; it only gates optional backends
    /// like Langfuse.
    pub enabled: bool,

    pub langfuse: Option<LangfuseConfig>,
}

impl ObservabilityConfig {
    /// `OBSERVABILITY_ENABLED`, `LANGFUSE_PUBLIC_KEY`, `LANGFUSE_SECRET_KEY`,
    /// `LANGFUSE_HOST`, `LANGFUSE_RELEASE`, `LANGFUSE_FLUSH_INTERVAL_MS`,
    /// `LANGFUSE_MAX_BATCH_SIZE`.
    pub fn from_env() -> Self {
        let langfuse = LangfuseConfig::from_env();
        let default_enabled = langfuse.is_some();
        let enabled = env::var("OBSERVABILITY_ENABLED")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(default_enabled);

        Self { enabled, langfuse }
    }

    pub fn langfuse_enabled(&self) -> bool {
        self.enabled && self.langfuse.is_some()
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone)]
pub struct LangfuseConfig {
    pub public_key: String,
    pub secret_key: String,
    pub host: String,
    pub release: Option<String>,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
}

impl LangfuseConfig {
    /// Returns `None` if either key is unset, so the caller can treat
    /// Langfuse as simply absent rather than misconfigured.
    pub fn from_env() -> Option<Self> {
        let public_key = env::var("LANGFUSE_PUBLIC_KEY").ok()?;
        let secret_key = env::var("LANGFUSE_SECRET_KEY").ok()?;
        if public_key.is_empty() || secret_key.is_empty() {
            return None;
        }

        let host = env::var("LANGFUSE_HOST").unwrap_or_else(|_| "https://cloud.langfuse.com".to_string());
        let release = env::var("LANGFUSE_RELEASE").ok();
        let flush_interval_ms = env::var("LANGFUSE_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);
        let max_batch_size = env::var("LANGFUSE_MAX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        Some(Self {
            public_key,
            secret_key,
            host,
            release,
            flush_interval_ms,
            max_batch_size,
        })
    }

    pub fn otlp_endpoint(&self) -> String {
        format!("{}/api/public/otel", self.host.trim_end_matches('/'))
    }

    pub fn auth_header(&self) -> String {
        use base64::Engine;
        let credentials = format!("{}:{}", self.public_key, self.secret_key);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        format!("Basic {}", encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LangfuseConfig {
        LangfuseConfig {
            public_key: "pk-lf-test".to_string(),
            secret_key: "sk-lf-secret".to_string(),
            host: "https://cloud.langfuse.com".to_string(),
            release: None,
            flush_interval_ms: 5000,
            max_batch_size: 100,
        }
    }

    #[test]
    fn auth_header_is_basic_base64_of_both_keys() {
        let header = test_config().auth_header();
        assert!(header.starts_with("Basic "));

        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header.strip_prefix("Basic ").unwrap())
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "pk-lf-test:sk-lf-secret");
    }

    #[test]
    fn otlp_endpoint_strips_trailing_slash() {
        let mut config = test_config();
        assert_eq!(config.otlp_endpoint(), "https://cloud.langfuse.com/api/public/otel");

        config.host = "https://cloud.langfuse.com/".to_string();
        assert_eq!(config.otlp_endpoint(), "https://cloud.langfuse.com/api/public/otel");
    }
}
