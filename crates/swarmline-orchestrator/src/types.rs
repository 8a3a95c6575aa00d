use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use swarmline_core::{Payload, SwarmlineError};
use uuid::Uuid;

/// Task priority, 1 (critical) through 5 (background). Lower dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const LOW: Priority = Priority(4);
    pub const BACKGROUND: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, SwarmlineError> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SwarmlineError::InvalidInput(format!(
                "priority must be between 1 and 5, got {value}"
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = SwarmlineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a [`SwarmTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of submitted work.
///
/// Owned by the scheduler. `assigned_instance` is an id into the instance
/// pool, never a pointer, and while the task is running the instance lists
/// this task in its `current_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: Uuid,
    pub description: String,
    pub input: Payload,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Agent requested by the submitter, if any.
    pub preferred_agent: Option<String>,
    /// Agent the dispatcher resolved for the current or last attempt.
    pub assigned_agent: Option<String>,
    pub assigned_instance: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub subtask_ids: Vec<Uuid>,
    /// Depth in the subtask hierarchy (0 = root task).
    pub depth: u32,
    /// The streamed execution record for this task.
    pub execution_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_time_ms: Option<u64>,
    pub cancel_requested: bool,
    /// Submission order, kept across retries for FIFO within a priority band.
    #[serde(skip)]
    pub(crate) queue_seq: u64,
}

impl SwarmTask {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Everything needed to submit a task.
///
/// ```
/// use swarmline_orchestrator::{Priority, TaskRequest};
///
/// let request = TaskRequest::new("summarize the release notes")
///     .with_priority(Priority::HIGH)
///     .with_agent("writer")
///     .with_user("alice");
/// assert_eq!(request.priority, Priority::HIGH);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub description: String,
    #[serde(default)]
    pub input: Payload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub preferred_agent: Option<String>,
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

pub(crate) fn default_user() -> String {
    "anonymous".to_string()
}
fn default_mode() -> String {
    "agent".to_string()
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            input: Payload::new(),
            priority: Priority::default(),
            preferred_agent: None,
            user_id: default_user(),
            mode: default_mode(),
            max_retries: None,
            parent_id: None,
        }
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Lifecycle of an [`AgentInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Ready but unused beyond the idle threshold.
    Idle,
    Initializing,
    Ready,
    Busy,
    /// Held out of dispatch by an operator.
    Paused,
    /// Error count exceeded the health threshold; no new work until recycled.
    Error,
    /// Draining its in-flight tasks before removal.
    Terminating,
    Terminated,
}

impl InstanceStatus {
    /// Whether new tasks may be assigned to an instance in this status.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Idle | Self::Ready | Self::Busy)
    }

    /// Whether the instance counts against its agent's instance cap.
    pub fn holds_slot(self) -> bool {
        !matches!(self, Self::Error | Self::Terminating | Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Initializing => "initializing",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Error => "error",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A live, capacity-bounded worker for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    /// Agent this instance executes for, by registry name.
    pub agent_name: String,
    pub status: InstanceStatus,
    pub current_tasks: BTreeSet<Uuid>,
    /// Per-instance concurrency limit taken from the agent's metadata.
    pub max_concurrent_tasks: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    /// Mean execution time of completed tasks.
    pub avg_execution_ms: f64,
    pub last_active: DateTime<Utc>,
    pub health_score: f64,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(agent_name: impl Into<String>, max_concurrent_tasks: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            status: InstanceStatus::Initializing,
            current_tasks: BTreeSet::new(),
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            total_completed: 0,
            total_failed: 0,
            avg_execution_ms: 0.0,
            last_active: now,
            health_score: 1.0,
            error_count: 0,
            created_at: now,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.status.accepts_work() && self.current_tasks.len() < self.max_concurrent_tasks
    }
}

/// Aggregate scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Attempts that were requeued after a transient failure.
    pub retried: u64,
    /// Tasks currently running.
    pub active: usize,
    pub pending: usize,
    pub agents_registered: usize,
    /// Agents with at least one running task.
    pub agents_active: usize,
    /// Live instances across all agents.
    pub instances: usize,
}

impl SwarmMetrics {
    /// Dashboard view grouped by concern.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tasks": {
                "submitted": self.submitted,
                "completed": self.completed,
                "failed": self.failed,
                "cancelled": self.cancelled,
                "retried": self.retried,
                "active": self.active,
                "pending": self.pending,
            },
            "agents": {
                "registered": self.agents_registered,
                "active": self.agents_active,
                "instances": self.instances,
            },
        })
    }
}
