use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promptkit_contracts::{event_types, StreamElement};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::event_bus::Event;
use crate::retry::{retry_transient, BackoffConfig};
use crate::stage::Stage;
use crate::traits::StateStore;

const LOAD_BACKOFF: BackoffConfig = BackoffConfig::new(2, Duration::from_millis(50), Duration::from_millis(500));

/// Head-of-pipeline stage: loads persisted history and variables into the
/// context. A not-found conversation starts with empty state rather than
/// failing; a transient store error retries up to `LOAD_BACKOFF` attempts
/// before surfacing.
pub struct StateStoreLoadStage {
    store: Arc<dyn StateStore>,
}

impl StateStoreLoadStage {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for StateStoreLoadStage {
    fn name(&self) -> &str {
        "state_store_load"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let conversation_id = ctx.conversation_id;
        let loaded = retry_transient(LOAD_BACKOFF, || {
            let store = self.store.clone();
            async move { store.load(conversation_id).await }
        })
        .await?;

        let found = loaded.is_some();
        if let Some(state) = loaded {
            ctx.set_messages(state.messages).await;
            for (key, value) in state.variables {
                ctx.set_variable(key, value).await;
            }
        }

        ctx.events
            .publish(Event::new(
                event_types::STATE_LOADED,
                ctx.run_id,
                conversation_id,
                serde_json::json!({ "conversation_id": conversation_id, "found": found }),
            ))
            .await;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Tail-of-pipeline stage: persists the updated message list and variables.
/// Runs even when `short_circuit` is set (a validator rejection still saves
/// whatever state exists), per the spec's save-always-unless-failed-before-
/// any-mutation rule. Writes are a full replacement keyed by conversation ID,
/// so they're idempotent by construction.
pub struct StateStoreSaveStage {
    store: Arc<dyn StateStore>,
}

impl StateStoreSaveStage {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for StateStoreSaveStage {
    fn name(&self) -> &str {
        "state_store_save"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        while let Some(element) = input.recv().await {
            if output.send(element).await.is_err() {
                break;
            }
        }

        let state = crate::traits::ConversationState {
            messages: ctx.messages().await,
            variables: ctx.variables().await,
            trace: None,
        };
        let conversation_id = ctx.conversation_id;
        self.store
            .save(conversation_id, state)
            .await
            .map_err(|err| Error::transient("state_store_save", anyhow::anyhow!(err.to_string())))?;

        ctx.events
            .publish(Event::new(
                event_types::STATE_SAVED,
                ctx.run_id,
                conversation_id,
                serde_json::json!({ "conversation_id": conversation_id }),
            ))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use crate::memory::InMemoryStateStore;
    use promptkit_contracts::Message;

    fn ctx(conversation_id: Uuid) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(conversation_id, None, false, Arc::new(NoOpEventBus)))
    }

    #[tokio::test]
    async fn load_initializes_empty_state_when_not_found() {
        let store = Arc::new(InMemoryStateStore::default());
        let stage = StateStoreLoadStage::new(store);
        let (_tx, rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        drop(out_tx);
        let c = ctx(Uuid::now_v7());
        stage.process(rx, mpsc::channel(1).0, c.clone()).await.unwrap();
        assert!(c.messages().await.is_empty());
        let _ = out_rx.try_recv();
    }

    #[tokio::test]
    async fn save_persists_current_context_messages() {
        let store = Arc::new(InMemoryStateStore::default());
        let stage = StateStoreSaveStage::new(store.clone());
        let conversation_id = Uuid::now_v7();
        let c = ctx(conversation_id);
        c.push_message(Message::user("hi")).await;

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (out_tx, _out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, c).await.unwrap();

        let saved = store.load(conversation_id).await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 1);
    }
}
