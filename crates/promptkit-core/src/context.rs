use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use promptkit_contracts::{CostInfo, FinishReason, Message, ToolCall, ToolDescriptor, ToolResult};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::event_bus::EventBus;
use promptkit_contracts::StreamElement;

/// Reason + flag for a mid-stream interruption (barge-in). Distinct from
/// cancellation: the pipeline is still expected to reach state-save.
#[derive(Debug, Default)]
struct InterruptState {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Per-invocation mutable state threaded through every stage in a pipeline
/// run. Created once by the orchestrator per `send`/`send_stream` call.
///
/// Fields that can be written by more than one concurrently-running stage
/// (the cost accumulator, pending tool calls) carry their own lock. Every
/// other field is written by exactly one stage at a time by protocol — e.g.
/// the provider-call stage is the sole writer of `response`/`raw_response` —
/// and is still wrapped in a lock here because stages run as independent
/// tokio tasks and the context is shared via `Arc`.
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Option<String>,

    pub cancellation: CancellationToken,
    interrupt: InterruptState,
    short_circuit: AtomicBool,

    system_prompt: RwLock<Option<String>>,
    user_prompt: RwLock<Option<String>>,
    variables: RwLock<HashMap<String, String>>,
    allowed_tools: RwLock<HashSet<String>>,
    tool_defs: RwLock<Vec<ToolDescriptor>>,

    messages: Mutex<Vec<Message>>,
    tool_results: Mutex<Vec<ToolResult>>,
    pending_tool_calls: Mutex<HashMap<String, ToolCall>>,

    cost: Mutex<CostInfo>,
    finish_reason: Mutex<Option<FinishReason>>,
    response: Mutex<Option<Message>>,
    raw_response: Mutex<Option<serde_json::Value>>,
    metadata: Mutex<serde_json::Map<String, serde_json::Value>>,

    pub streaming: bool,
    /// Present only in `send_stream` mode: elements the orchestrator forwards
    /// directly to the caller, independent of the inter-stage pipeline
    /// channels.
    pub stream_out: Option<mpsc::Sender<StreamElement>>,

    pub events: Arc<dyn EventBus>,
}

impl ExecutionContext {
    pub fn new(
        conversation_id: Uuid,
        user_id: Option<String>,
        streaming: bool,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            conversation_id,
            user_id,
            cancellation: CancellationToken::new(),
            interrupt: InterruptState::default(),
            short_circuit: AtomicBool::new(false),
            system_prompt: RwLock::new(None),
            user_prompt: RwLock::new(None),
            variables: RwLock::new(HashMap::new()),
            allowed_tools: RwLock::new(HashSet::new()),
            tool_defs: RwLock::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            tool_results: Mutex::new(Vec::new()),
            pending_tool_calls: Mutex::new(HashMap::new()),
            cost: Mutex::new(CostInfo::default()),
            finish_reason: Mutex::new(None),
            response: Mutex::new(None),
            raw_response: Mutex::new(None),
            metadata: Mutex::new(serde_json::Map::new()),
            streaming,
            stream_out: None,
            events,
        }
    }

    // -- short circuit -----------------------------------------------------

    /// Once set, no further stages after the current one should run (except
    /// state-save, which always runs).
    pub fn set_short_circuit(&self) {
        self.short_circuit.store(true, Ordering::SeqCst);
    }

    pub fn is_short_circuited(&self) -> bool {
        self.short_circuit.load(Ordering::SeqCst)
    }

    // -- interrupt -----------------------------------------------------------

    pub fn set_interrupt(&self, reason: impl Into<String>) {
        self.interrupt.flag.store(true, Ordering::SeqCst);
        let reason = reason.into();
        if let Ok(mut guard) = self.interrupt.reason.try_lock() {
            *guard = Some(reason);
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.flag.load(Ordering::SeqCst)
    }

    pub async fn interrupt_reason(&self) -> Option<String> {
        self.interrupt.reason.lock().await.clone()
    }

    // -- messages -------------------------------------------------------------

    pub async fn push_message(&self, message: Message) {
        self.messages.lock().await.push(message);
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.lock().await = messages;
    }

    // -- prompts / variables ----------------------------------------------------

    pub async fn set_system_prompt(&self, prompt: String) {
        *self.system_prompt.write().await = Some(prompt);
    }

    pub async fn system_prompt(&self) -> Option<String> {
        self.system_prompt.read().await.clone()
    }

    pub async fn set_user_prompt(&self, prompt: String) {
        *self.user_prompt.write().await = Some(prompt);
    }

    pub async fn user_prompt(&self) -> Option<String> {
        self.user_prompt.read().await.clone()
    }

    pub async fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.write().await.insert(key.into(), value.into());
    }

    pub async fn variables(&self) -> HashMap<String, String> {
        self.variables.read().await.clone()
    }

    // -- tools ------------------------------------------------------------------

    pub async fn set_allowed_tools(&self, tools: HashSet<String>) {
        *self.allowed_tools.write().await = tools;
    }

    pub async fn is_tool_allowed(&self, name: &str) -> bool {
        let allowed = self.allowed_tools.read().await;
        allowed.is_empty() || allowed.contains(name)
    }

    pub async fn set_tool_defs(&self, defs: Vec<ToolDescriptor>) {
        *self.tool_defs.write().await = defs;
    }

    pub async fn tool_defs(&self) -> Vec<ToolDescriptor> {
        self.tool_defs.read().await.clone()
    }

    pub async fn record_tool_result(&self, result: ToolResult) {
        self.tool_results.lock().await.push(result);
    }

    pub async fn tool_results(&self) -> Vec<ToolResult> {
        self.tool_results.lock().await.clone()
    }

    pub async fn track_pending_call(&self, call: ToolCall) {
        self.pending_tool_calls.lock().await.insert(call.id.clone(), call);
    }

    pub async fn resolve_pending_call(&self, call_id: &str) {
        self.pending_tool_calls.lock().await.remove(call_id);
    }

    pub async fn pending_call_ids(&self) -> Vec<String> {
        self.pending_tool_calls.lock().await.keys().cloned().collect()
    }

    // -- cost ---------------------------------------------------------------

    pub async fn add_cost(&self, delta: CostInfo) {
        self.cost.lock().await.add(&delta);
    }

    pub async fn cost(&self) -> CostInfo {
        *self.cost.lock().await
    }

    // -- finish / response ------------------------------------------------------

    pub async fn set_finish_reason(&self, reason: FinishReason) {
        *self.finish_reason.lock().await = Some(reason);
    }

    pub async fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason.lock().await.clone()
    }

    pub async fn set_response(&self, message: Message) {
        *self.response.lock().await = Some(message);
    }

    pub async fn response(&self) -> Option<Message> {
        self.response.lock().await.clone()
    }

    pub async fn set_raw_response(&self, raw: serde_json::Value) {
        *self.raw_response.lock().await = Some(raw);
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.lock().await.insert(key.into(), value);
    }

    pub async fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        self.metadata.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus))
    }

    #[tokio::test]
    async fn short_circuit_is_sticky() {
        let ctx = ctx();
        assert!(!ctx.is_short_circuited());
        ctx.set_short_circuit();
        assert!(ctx.is_short_circuited());
    }

    #[tokio::test]
    async fn cost_accumulates_monotonically() {
        let ctx = ctx();
        ctx.add_cost(CostInfo::new(10, 5, 0, 0.1)).await;
        ctx.add_cost(CostInfo::new(20, 10, 0, 0.2)).await;
        let total = ctx.cost().await;
        assert_eq!(total.input_tokens, 30);
        assert!((total.estimated_cost_usd - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn interrupt_records_reason() {
        let ctx = ctx();
        assert!(!ctx.is_interrupted());
        ctx.set_interrupt("banned word detected");
        assert!(ctx.is_interrupted());
        assert_eq!(
            ctx.interrupt_reason().await,
            Some("banned word detected".to_string())
        );
    }
}
