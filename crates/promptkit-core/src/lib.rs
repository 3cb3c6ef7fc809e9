pub mod cancellation;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod memory;
pub mod pipeline;
pub mod retry;
pub mod stage;
pub mod stages;
pub mod tools;
pub mod traits;

pub use context::ExecutionContext;
pub use error::{Error, ErrorKind, Result};
pub use event_bus::{Event, EventBus, EventListener, InMemoryEventBus, NoOpEventBus, SubscriptionHandle};
pub use pipeline::PipelineDeps;
pub use stage::{Pipeline, PipelineBuilder, Stage, DEFAULT_AUDIO_BUFFER, DEFAULT_TEXT_BUFFER};
