use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tool::ToolDescriptor;

/// An immutable, parsed configuration value. Pack-file loading and schema
/// validation are out of scope here — the core consumes an already-parsed
/// `Pack`, loaded once and shared across every conversation built against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub id: String,
    pub version: String,

    pub template_engine: TemplateEngineDescriptor,

    pub prompts: HashMap<String, Prompt>,
    pub fragments: HashMap<String, String>,
    pub tools: HashMap<String, ToolDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSpec>,
}

impl Pack {
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEngineDescriptor {
    pub syntax: String,
    pub version: String,
}

/// A named prompt within a pack: its system template, declared variables,
/// call parameters, and the tool names it exposes to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub version: String,
    pub system_template: String,
    pub variables: Vec<Variable>,
    pub parameters: PromptParameters,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// The workflow surface a `Pack` may optionally carry. Only the per-state
/// tool-registration boundary is this crate's concern; the state machine and
/// transition rules themselves are out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub entry: String,
    pub states: HashMap<String, WorkflowState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub prompt_task: String,
    #[serde(default)]
    pub transitions: HashMap<String, String>,
}
