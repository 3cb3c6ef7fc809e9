//! Foundation data types shared by every PromptKit crate.
//!
//! Everything here is plain, serde-derived data: no I/O, no async, no trait
//! objects. Collaborator traits (`ProviderAdapter`, `StateStore`, ...) and the
//! stage/pipeline machinery that operate on these types live in
//! `promptkit-core`.

pub mod cost;
pub mod event;
pub mod message;
pub mod pack;
pub mod stream;
pub mod tool;

pub use cost::CostInfo;
pub use event::{event_types, EventPayload};
pub use message::{ContentPart, MediaContent, MediaSource, Message, Role, StorageReference};
pub use pack::{Pack, Prompt, PromptParameters, Variable, WorkflowSpec};
pub use stream::{AudioFormat, FinishReason, StreamElement};
pub use tool::{ExecutionMode, ToolCall, ToolDescriptor, ToolResult, ToolResultStatus};
