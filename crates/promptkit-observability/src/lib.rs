//! Observability integrations for PromptKit.
//!
//! Key design decisions:
//! - Uses the event subscription pattern (`promptkit_core::event_bus`) to
//!   keep the pipeline decoupled from observability.
//! - Supports multiple backends via the `ObservabilityBackend` trait; the
//!   `tracing` backend is always on, Langfuse is feature-flagged.

pub mod backend;
pub mod config;
pub mod listener;

#[cfg(feature = "langfuse")]
pub mod langfuse;

use std::sync::Arc;

pub use backend::{NoopBackend, ObservabilityBackend, ObservabilityEvent, TracingBackend};
pub use config::{LangfuseConfig, ObservabilityConfig};
pub use listener::ObservabilityListener;

#[cfg(feature = "langfuse")]
pub use langfuse::LangfuseBackend;

/// Initializes the global `tracing` subscriber from `RUST_LOG`, falling back
/// to `default_directive` (e.g. `"promptkit_runtime=info"`) when unset.
pub fn init_tracing(default_directive: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Builds the backend set implied by `ObservabilityConfig`: `tracing` is
/// always included, Langfuse is added when configured and the feature is
/// compiled in.
pub fn backends_from_config(config: &ObservabilityConfig) -> Vec<Arc<dyn ObservabilityBackend>> {
    let mut backends: Vec<Arc<dyn ObservabilityBackend>> = vec![Arc::new(TracingBackend)];

    #[cfg(feature = "langfuse")]
    if config.langfuse_enabled() {
        if let Some(langfuse) = &config.langfuse {
            match LangfuseBackend::new(langfuse.clone()) {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(e) => tracing::warn!(error = %e, "failed to initialize langfuse backend"),
            }
        }
    }

    #[cfg(not(feature = "langfuse"))]
    let _ = config;

    backends
}
