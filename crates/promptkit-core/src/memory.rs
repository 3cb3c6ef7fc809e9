//! In-memory collaborator implementations for tests and examples, following
//! the teacher's `memory.rs` (`InMemoryEventEmitter`, `NoOpEventEmitter`, ...)
//! convention of shipping trivial doubles alongside the traits they satisfy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{Message, StorageReference, ToolDescriptor};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tools::ToolExecutionResult;
use crate::traits::{ConversationState, MediaStorage, StateStore, TemplateRenderer, ToolRegistry};

#[derive(Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<Uuid, ConversationState>>,
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, conversation_id: Uuid) -> Result<Option<ConversationState>> {
        Ok(self.states.read().await.get(&conversation_id).cloned())
    }

    async fn save(&self, conversation_id: Uuid, state: ConversationState) -> Result<()> {
        self.states.write().await.insert(conversation_id, state);
        Ok(())
    }

    async fn delete(&self, conversation_id: Uuid) -> Result<()> {
        self.states.write().await.remove(&conversation_id);
        Ok(())
    }
}

/// Content-addressed, deduplicated by hash with a simple reference count.
#[derive(Default)]
pub struct InMemoryMediaStorage {
    blobs: RwLock<HashMap<String, (Vec<u8>, String, u64)>>,
}

#[async_trait]
impl MediaStorage for InMemoryMediaStorage {
    async fn store(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: serde_json::Value,
    ) -> Result<StorageReference> {
        use sha2::{Digest, Sha256};
        let hash = hex::encode(Sha256::digest(bytes));

        let mut blobs = self.blobs.write().await;
        blobs
            .entry(hash.clone())
            .and_modify(|(_, _, refcount)| *refcount += 1)
            .or_insert_with(|| (bytes.to_vec(), mime_type.to_string(), 1));

        let mut meta = serde_json::Map::new();
        if let serde_json::Value::Object(map) = metadata {
            meta = map;
        }
        meta.insert("mime_type".into(), serde_json::Value::String(mime_type.to_string()));

        Ok(StorageReference {
            id: hash,
            backend: "memory".into(),
            metadata: meta,
        })
    }

    async fn retrieve(&self, reference: &StorageReference) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(&reference.id)
            .map(|(bytes, _, _)| bytes.clone())
            .ok_or_else(|| Error::config(format!("no blob for reference {}", reference.id)))
    }

    async fn delete(&self, reference: &StorageReference) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        if let Some((_, _, refcount)) = blobs.get_mut(&reference.id) {
            *refcount -= 1;
            if *refcount == 0 {
                blobs.remove(&reference.id);
            }
        }
        Ok(())
    }
}

/// Simple `{{variable}}` substitution. Real deployments inject a richer
/// renderer (Handlebars, Tera, ...); the core only needs the named-resolver
/// contract.
pub struct SimpleTemplateRenderer;

impl TemplateRenderer for SimpleTemplateRenderer {
    fn render(&self, template: &str, variables: &HashMap<String, String>) -> Result<String> {
        let mut rendered = template.to_string();
        for (key, value) in variables {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(rendered)
    }
}

type HandlerFn = Arc<dyn Fn(serde_json::Value) -> ToolExecutionResult + Send + Sync>;

/// A name-keyed registry dispatching to in-process closures. Used by tests
/// and by any deployment whose tools are native Rust functions rather than
/// HTTP/MCP endpoints.
#[derive(Default, Clone)]
pub struct InProcessToolRegistry {
    descriptors: HashMap<String, ToolDescriptor>,
    handlers: HashMap<String, HandlerFn>,
}

impl InProcessToolRegistry {
    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: impl Fn(serde_json::Value) -> ToolExecutionResult + Send + Sync + 'static,
    ) {
        self.handlers.insert(descriptor.name.clone(), Arc::new(handler));
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }
}

#[async_trait]
impl ToolRegistry for InProcessToolRegistry {
    fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.descriptors.get(name).cloned()
    }

    fn all(&self) -> Vec<ToolDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    async fn execute(&self, descriptor: &ToolDescriptor, args: serde_json::Value) -> ToolExecutionResult {
        match self.handlers.get(&descriptor.name) {
            Some(handler) => handler(args),
            None => ToolExecutionResult::InternalError(crate::tools::ToolInternalError::new(format!(
                "no handler registered for tool '{}'",
                descriptor.name
            ))),
        }
    }
}

/// Round-trip helper, not a trait impl: seeds a state store with history, so
/// integration tests can assert `send` produces the expected run result.
pub async fn seed_history(store: &InMemoryStateStore, conversation_id: Uuid, messages: Vec<Message>) {
    store
        .save(
            conversation_id,
            ConversationState {
                messages,
                variables: HashMap::new(),
                trace: None,
            },
        )
        .await
        .expect("in-memory store save is infallible");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn media_storage_dedups_identical_bytes() {
        let storage = InMemoryMediaStorage::default();
        let a = storage.store(b"hello", "text/plain", serde_json::json!({})).await.unwrap();
        let b = storage.store(b"hello", "text/plain", serde_json::json!({})).await.unwrap();
        assert_eq!(a.id, b.id);
        let back = storage.retrieve(&a).await.unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn template_renderer_substitutes_variables() {
        let renderer = SimpleTemplateRenderer;
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        assert_eq!(renderer.render("Hello {{name}}", &vars).unwrap(), "Hello Ada");
    }
}
