use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swarmline_core::Payload;
use uuid::Uuid;

/// Well-known event type tags.
pub mod event_types {
    /// The execution was accepted and is waiting for capacity.
    pub const QUEUED: &str = "queued";
    /// An attempt started on an agent instance.
    pub const STARTED: &str = "started";
    /// Free-form progress reported by the agent body.
    pub const PROGRESS: &str = "progress";
    /// A step was appended to the execution's step summary.
    pub const STEP: &str = "step";
    /// An artifact reference was recorded.
    pub const ARTIFACT: &str = "artifact";
    /// An attempt failed and another one is scheduled.
    pub const RETRYING: &str = "retrying";
    /// Terminal: the execution produced a result.
    pub const COMPLETED: &str = "completed";
    /// Terminal: the execution failed permanently.
    pub const FAILED: &str = "failed";
    /// Terminal: the execution was cancelled.
    pub const CANCELLED: &str = "cancelled";

    /// Whether `event_type` ends an execution's stream.
    pub fn is_terminal(event_type: &str) -> bool {
        matches!(event_type, COMPLETED | FAILED | CANCELLED)
    }
}

/// Lifecycle of a [`PersistentExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, failed and cancelled executions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The terminal event tag matching this status, if any.
    pub fn terminal_event(self) -> Option<&'static str> {
        match self {
            Self::Completed => Some(event_types::COMPLETED),
            Self::Failed => Some(event_types::FAILED),
            Self::Cancelled => Some(event_types::CANCELLED),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One sequence-numbered record in an execution's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub execution_id: Uuid,
    /// Starts at 1 per execution and increases by exactly one per event.
    pub sequence: u64,
    pub event_type: String,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl BufferedEvent {
    pub fn is_terminal(&self) -> bool {
        event_types::is_terminal(&self.event_type)
    }
}

/// The streaming/observability record for one task's run.
///
/// The event log itself lives next to this record inside the hub and is not
/// part of the persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentExecution {
    pub id: Uuid,
    pub user_id: String,
    pub task_description: String,
    pub mode: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PersistentExecution {
    pub fn new(
        user_id: impl Into<String>,
        task_description: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            task_description: task_description.into(),
            mode: mode.into(),
            status: ExecutionStatus::Pending,
            steps: Vec::new(),
            result: None,
            artifacts: Vec::new(),
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Partial state sent to the durable store alongside a status change.
    pub fn partial_state(&self) -> serde_json::Value {
        serde_json::json!({
            "steps": self.steps,
            "result": self.result,
            "artifacts": self.artifacts,
            "error": self.error,
            "cancel_requested": self.cancel_requested,
            "started_at": self.started_at,
            "completed_at": self.completed_at,
        })
    }
}

/// What a subscriber observes on an execution stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamItem {
    /// A buffered event, delivered in strict sequence order.
    Event(BufferedEvent),
    /// Emitted when no event arrived within the keepalive interval.
    Keepalive { timestamp: DateTime<Utc> },
    /// Events after `requested_from` and before `first_available` are no
    /// longer retained. The client must resync from a snapshot.
    Gap {
        requested_from: u64,
        first_available: u64,
    },
}

impl StreamItem {
    /// The wrapped event, if this item carries one.
    pub fn as_event(&self) -> Option<&BufferedEvent> {
        match self {
            StreamItem::Event(event) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert_eq!(
            ExecutionStatus::Failed.terminal_event(),
            Some(event_types::FAILED)
        );
        assert_eq!(ExecutionStatus::Running.terminal_event(), None);
    }

    #[test]
    fn test_stream_item_serialization() {
        let item = StreamItem::Gap {
            requested_from: 0,
            first_available: 12,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "gap");
        assert_eq!(json["first_available"], 12);

        let event = StreamItem::Event(BufferedEvent {
            execution_id: Uuid::new_v4(),
            sequence: 3,
            event_type: event_types::PROGRESS.to_string(),
            payload: swarmline_core::payload! { "pct" => 40 },
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&event).unwrap();
        let parsed: StreamItem = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_new_execution_is_pending() {
        let exec = PersistentExecution::new("user-1", "summarize", "agent");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(!exec.cancel_requested);
        assert!(exec.partial_state()["steps"].as_array().unwrap().is_empty());
    }
}
