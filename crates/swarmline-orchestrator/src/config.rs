use crate::registry::AgentMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarmline_core::{Payload, SwarmlineError, SwarmlineResult};
use swarmline_stream::StreamConfig;

/// Complete runtime configuration, usually loaded from `swarmline.toml`.
///
/// ```toml
/// [scheduler]
/// max_concurrent_tasks = 4
///
/// [[agents]]
/// name = "writer"
/// kind = "echo"
/// capabilities = ["summarize", "draft"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl SwarmConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> SwarmlineResult<Self> {
        let config: SwarmConfig =
            toml::from_str(s).map_err(|e| SwarmlineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: &Path) -> SwarmlineResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SwarmlineError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> SwarmlineResult<String> {
        toml::to_string_pretty(self).map_err(|e| SwarmlineError::Config(e.to_string()))
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> SwarmlineResult<()> {
        let s = &self.scheduler;
        if s.max_concurrent_tasks == 0 {
            return Err(config_err("scheduler.max_concurrent_tasks must be > 0"));
        }
        if s.max_instances_per_agent == 0 {
            return Err(config_err("scheduler.max_instances_per_agent must be > 0"));
        }
        if s.execution_timeout_secs == 0 {
            return Err(config_err("scheduler.execution_timeout_secs must be > 0"));
        }
        if s.retry_backoff_max_ms < s.retry_backoff_base_ms {
            return Err(config_err(
                "scheduler.retry_backoff_max_ms must be >= retry_backoff_base_ms",
            ));
        }

        let h = &self.health;
        if h.interval_secs == 0 {
            return Err(config_err("health.interval_secs must be > 0"));
        }
        if !(h.decay_factor > 0.0 && h.decay_factor <= 1.0) {
            return Err(config_err("health.decay_factor must be in (0, 1]"));
        }
        if !(h.error_penalty > 0.0 && h.error_penalty <= 1.0) {
            return Err(config_err("health.error_penalty must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&h.floor) {
            return Err(config_err("health.floor must be in [0, 1)"));
        }

        if self.cleanup.interval_secs == 0 {
            return Err(config_err("cleanup.interval_secs must be > 0"));
        }
        if self.stream.max_buffered_events == 0 || self.stream.subscriber_queue_capacity == 0 {
            return Err(config_err(
                "stream.max_buffered_events and stream.subscriber_queue_capacity must be > 0",
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(config_err("agent name must not be empty"));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(SwarmlineError::Config(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            if agent.max_concurrent_tasks == 0 {
                return Err(SwarmlineError::Config(format!(
                    "agent '{}': max_concurrent_tasks must be > 0",
                    agent.name
                )));
            }
        }
        Ok(())
    }
}

/// Seconds as a chrono duration, clamped to what chrono can represent.
fn chrono_secs(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    chrono::Duration::seconds(secs)
}

fn config_err(msg: &str) -> SwarmlineError {
    SwarmlineError::Config(msg.to_string())
}

/// Dispatch, timeout and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global ceiling on running tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_instances_per_agent")]
    pub max_instances_per_agent: usize,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default)]
    pub retry_jitter: bool,
    #[serde(default = "default_max_subtask_depth")]
    pub max_subtask_depth: u32,
    #[serde(default = "default_max_subtasks_per_task")]
    pub max_subtasks_per_task: usize,
}

fn default_max_concurrent_tasks() -> usize {
    10
}
fn default_max_instances_per_agent() -> usize {
    4
}
fn default_execution_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_max_subtask_depth() -> u32 {
    3
}
fn default_max_subtasks_per_task() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_instances_per_agent: default_max_instances_per_agent(),
            execution_timeout_secs: default_execution_timeout_secs(),
            default_max_retries: default_max_retries(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
            retry_jitter: false,
            max_subtask_depth: default_max_subtask_depth(),
            max_subtasks_per_task: default_max_subtasks_per_task(),
        }
    }
}

impl SchedulerConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Instance health scoring and recycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Idle time after which each tick decays the health score.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Error count above which each tick applies `error_penalty`.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_error_penalty")]
    pub error_penalty: f64,
    /// Instances scoring below this are recycled.
    #[serde(default = "default_floor")]
    pub floor: f64,
}

fn default_health_interval_secs() -> u64 {
    30
}
fn default_idle_threshold_secs() -> u64 {
    300
}
fn default_decay_factor() -> f64 {
    0.9
}
fn default_error_threshold() -> u32 {
    3
}
fn default_error_penalty() -> f64 {
    0.8
}
fn default_floor() -> f64 {
    0.3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            decay_factor: default_decay_factor(),
            error_threshold: default_error_threshold(),
            error_penalty: default_error_penalty(),
            floor: default_floor(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono_secs(self.idle_threshold_secs)
    }
}

/// Eviction of terminal tasks and executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    /// How long terminal work stays in memory.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_retention_secs() -> u64 {
    3600
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono_secs(self.retention_secs)
    }
}

/// Optional durable execution store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// When set, executions are written behind to JSON files here.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Declarative agent definition. `kind` picks the executor strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default = "default_agent_concurrency")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Strategy-specific settings.
    #[serde(default)]
    pub options: Payload,
}

fn default_category() -> String {
    "general".to_string()
}
fn default_agent_concurrency() -> usize {
    2
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            category: default_category(),
            capabilities: Vec::new(),
            required_tools: Vec::new(),
            max_concurrent_tasks: default_agent_concurrency(),
            model: None,
            temperature: None,
            options: Payload::new(),
        }
    }

    pub fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            name: self.name.clone(),
            category: self.category.clone(),
            capabilities: self.capabilities.clone(),
            required_tools: self.required_tools.clone(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            model: self.model.clone(),
            temperature: self.temperature,
        }
    }
}
