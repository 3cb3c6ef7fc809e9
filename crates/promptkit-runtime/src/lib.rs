//! The L4 process layer: turns `promptkit-core`'s pipeline plumbing and a
//! pack's collaborators into a long-lived service — process configuration,
//! reliability-wrapped providers, and the conversation orchestrator itself.

pub mod config;
pub mod orchestrator;
pub mod reliability;

pub use config::{CircuitBreakerSettings, Config, OrchestratorConfig, ProviderKind, RetryConfig};
pub use orchestrator::{ConversationOrchestrator, RunResult};
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, ReliableProvider, RetryPolicy};
