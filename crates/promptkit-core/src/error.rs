use thiserror::Error;

/// The error taxonomy from the spec's error-handling design, independent of
/// any particular variant's wire representation. `RetryPolicy` and the
/// circuit breaker in `promptkit-runtime` dispatch on this, not on the
/// concrete `Error` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable automatically: network timeout, 5xx, 429 with backoff.
    Transient,
    Validation,
    ToolPolicy,
    ToolExecution,
    Cancellation,
    Interrupt,
    Shutdown,
    Config,
    FatalProvider,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient error in {stage}: {source}")]
    Transient {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("validation failed in {validator}: {detail}")]
    Validation { validator: String, detail: String },

    #[error("tool policy violation: {detail}")]
    ToolPolicy { detail: String },

    #[error("tool '{name}' execution failed: {detail}")]
    ToolExecution { name: String, detail: String },

    #[error("cancelled")]
    Cancellation,

    #[error("interrupted: {reason}")]
    Interrupt { reason: String },

    #[error("orchestrator is shutting down")]
    Shutdown,

    #[error("shutdown timed out waiting for in-flight requests")]
    ShutdownTimeout,

    #[error("configuration error: {detail}")]
    Config { detail: String },

    #[error("fatal provider error ({provider_id}): {detail}")]
    FatalProvider { provider_id: String, detail: String },

    #[error("tool-calling loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded { max_rounds: u32 },

    #[error("stage '{stage}' panicked or closed unexpectedly")]
    StageFailure { stage: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::ToolPolicy { .. } => ErrorKind::ToolPolicy,
            Error::ToolExecution { .. } => ErrorKind::ToolExecution,
            Error::Cancellation => ErrorKind::Cancellation,
            Error::Interrupt { .. } => ErrorKind::Interrupt,
            Error::Shutdown => ErrorKind::Shutdown,
            Error::ShutdownTimeout => ErrorKind::Shutdown,
            Error::Config { .. } => ErrorKind::Config,
            Error::FatalProvider { .. } => ErrorKind::FatalProvider,
            Error::ToolLoopExceeded { .. } => ErrorKind::Config,
            Error::StageFailure { .. } => ErrorKind::Transient,
        }
    }

    pub fn transient(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Transient {
            stage: stage.into(),
            source: source.into(),
        }
    }

    pub fn validation(validator: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Validation {
            validator: validator.into(),
            detail: detail.into(),
        }
    }

    pub fn tool_policy(detail: impl Into<String>) -> Self {
        Error::ToolPolicy {
            detail: detail.into(),
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Error::Config {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
