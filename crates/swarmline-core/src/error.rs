use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

/// Top-level error type for the Swarmline runtime.
///
/// Variants map onto the scheduler's failure taxonomy. Execution failures
/// are converted into task state transitions by the runner and only reach
/// callers through a task's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum SwarmlineError {
    /// Unknown task, execution, instance or agent id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// The entity is terminal (or already evicted) and cannot be acted on.
    #[error("{0} is already terminal")]
    AlreadyTerminal(String),

    /// The global concurrency ceiling is reached. Tasks stay pending.
    #[error("Queue backpressure: {running}/{limit} tasks running")]
    QueueBackpressure {
        /// Tasks currently running.
        running: usize,
        /// Configured global ceiling.
        limit: usize,
    },

    /// The hard wall-clock execution limit was exceeded.
    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    ExecutionTimeout(Duration),

    /// The agent body returned an error.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// No instance could be obtained or spawned for the agent.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Events were dropped for a slow subscriber.
    #[error("Subscriber overflow on execution {execution_id}: {dropped} event(s) dropped")]
    SubscriberOverflow {
        /// Execution whose subscriber fell behind.
        execution_id: Uuid,
        /// Number of events dropped so far for that subscriber.
        dropped: u64,
    },

    /// The request itself is malformed; retrying cannot help.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Work was stopped by a cancellation signal that was not a user cancel.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the durable execution store.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SwarmlineError`].
pub type SwarmlineResult<T> = Result<T, SwarmlineError>;

impl SwarmlineError {
    /// Shorthand for [`SwarmlineError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a task that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout(_)
                | Self::ExecutionFailure(_)
                | Self::Cancelled(_)
                | Self::QueueBackpressure { .. }
                | Self::Store(_)
                | Self::Io(_)
        )
    }

    /// Stable snake_case label used in event payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::QueueBackpressure { .. } => "queue_backpressure",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::AgentUnavailable(_) => "agent_unavailable",
            Self::SubscriberOverflow { .. } => "subscriber_overflow",
            Self::InvalidInput(_) => "invalid_input",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = SwarmlineError::ExecutionTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Execution timed out after 1.5s");
    }

    #[test]
    fn test_transient_classification() {
        assert!(SwarmlineError::ExecutionFailure("boom".into()).is_transient());
        assert!(SwarmlineError::ExecutionTimeout(Duration::from_secs(1)).is_transient());
        assert!(!SwarmlineError::InvalidInput("bad".into()).is_transient());
        assert!(!SwarmlineError::AgentUnavailable("ghost".into()).is_transient());
        assert!(!SwarmlineError::not_found("task", Uuid::nil()).is_transient());
    }
}
