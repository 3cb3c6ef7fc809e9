//! Process entry point, grounded on the teacher's `everruns-worker/src/main.rs`
//! startup sequence: init tracing, connect storage, build the long-lived
//! service, wait on `ctrl_c`, shut down gracefully.

use std::sync::Arc;

use anyhow::Context;
use promptkit_anthropic::AnthropicProvider;
use promptkit_contracts::Pack;
use promptkit_core::event_bus::{EventBus, InMemoryEventBus};
use promptkit_core::memory::{InMemoryMediaStorage, InMemoryStateStore, InProcessToolRegistry, SimpleTemplateRenderer};
use promptkit_core::traits::ProviderAdapter;
use promptkit_core::PipelineDeps;
use promptkit_observability::{backends_from_config, ObservabilityConfig, ObservabilityListener};
use promptkit_openai::OpenAiProvider;
use promptkit_runtime::reliability::{CircuitBreakerConfig, ReliableProvider, RetryPolicy};
use promptkit_runtime::{Config, ConversationOrchestrator, ProviderKind};
use promptkit_storage::{Database, PostgresMediaStorage, PostgresStateStore};

/// Pack-file loading is explicitly out of the core's scope; the binary reads
/// a plain JSON file (the shape `Pack` already derives `Deserialize` for)
/// from `PROMPTKIT_PACK_PATH`, defaulting to `pack.json` in the working
/// directory.
fn load_pack() -> anyhow::Result<Pack> {
    let path = std::env::var("PROMPTKIT_PACK_PATH").unwrap_or_else(|_| "pack.json".to_string());
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading pack file at {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing pack file at {path}"))
}

fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn ProviderAdapter>> {
    let api_key = config
        .provider_api_key
        .clone()
        .context("provider API key not set (OPENAI_API_KEY / ANTHROPIC_API_KEY)")?;

    let inner: Arc<dyn ProviderAdapter> = match config.provider_kind {
        ProviderKind::OpenAi => {
            let mut provider = OpenAiProvider::new(api_key, config.provider_model.clone());
            if let Some(base_url) = &config.provider_base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        ProviderKind::Anthropic => {
            let mut provider = AnthropicProvider::new(api_key, config.provider_model.clone());
            if let Some(base_url) = &config.provider_base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
    };

    let retry = RetryPolicy::from(&config.retry);
    let breaker = CircuitBreakerConfig::from(&config.circuit_breaker);
    Ok(Arc::new(ReliableProvider::new(inner, retry, breaker)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    promptkit_observability::init_tracing("promptkit_runtime=info");
    tracing::info!("promptkit-runtime starting");

    let config = Config::from_env()?;

    let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let observability = ObservabilityListener::new(backends_from_config(&ObservabilityConfig::from_env()));
    let observability = Arc::new(observability);
    let _subscription = events.subscribe_all(observability).await;

    let (state_store, media_storage): (Arc<dyn promptkit_core::traits::StateStore>, Arc<dyn promptkit_core::traits::MediaStorage>) =
        if let Some(database_url) = &config.database_url {
            let db = Database::from_url(database_url).await.context("connecting to database")?;
            tracing::info!("database connection established");
            (Arc::new(PostgresStateStore::new(db.clone())), Arc::new(PostgresMediaStorage::new(db)))
        } else {
            tracing::warn!("DATABASE_URL not set, using in-memory state and media storage");
            (Arc::new(InMemoryStateStore::default()), Arc::new(InMemoryMediaStorage::default()))
        };

    let pack = load_pack().context("loading pack")?;
    let prompt_name = std::env::var("PROMPTKIT_PROMPT").unwrap_or_else(|_| "default".to_string());
    let prompt = pack
        .prompt(&prompt_name)
        .cloned()
        .with_context(|| format!("pack has no prompt named '{prompt_name}'"))?;

    let provider = build_provider(&config)?;
    let tool_descriptors = prompt
        .tools
        .iter()
        .filter_map(|name| pack.tools.get(name).cloned())
        .collect();

    let deps = PipelineDeps {
        provider,
        tools: Arc::new(InProcessToolRegistry::default()),
        tool_policy: config.tool_policy(),
        state_store,
        media_storage,
        template_renderer: Arc::new(SimpleTemplateRenderer),
        pre_validators: vec![],
        post_validators: vec![],
        prompt,
        tool_descriptors,
    };

    // Passive process: `send`/`send_stream` are called by an embedding API
    // layer, not this binary. It exists to hold the orchestrator and its
    // collaborators alive and to drain in-flight work on shutdown.
    let orchestrator = Arc::new(ConversationOrchestrator::new(deps, config.orchestrator.clone(), events));
    tracing::info!(max_concurrent = config.orchestrator.max_concurrent, "orchestrator ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight requests");

    orchestrator.shutdown(config.orchestrator.shutdown_timeout).await?;
    tracing::info!("shutdown complete");

    Ok(())
}
