//! Priority task scheduler for agent swarms.
//!
//! Tasks are queued by priority, dispatched to pooled agent instances under a
//! global concurrency ceiling, retried with exponential backoff on transient
//! failure, and streamed to subscribers through the execution hub. A health
//! monitor recycles degraded instances and a sweeper evicts old terminal work.
//!
//! # Main types
//!
//! - [`SwarmScheduler`]: Handle to the running scheduler and its public operations.
//! - [`AgentRegistry`]: Catalog of agents with their [`AgentBody`] executors.
//! - [`AgentSelector`]: Picks an agent for tasks that did not name one.
//! - [`InstancePool`]: Health-scored worker instances per agent.
//! - [`TaskQueue`]: Priority queue with delayed retry entries.
//! - [`SwarmConfig`]: TOML-backed runtime configuration.

/// Scheduler, pool, stream and agent configuration.
pub mod config;
/// Background instance health scoring and recycling.
pub mod monitor;
/// Agent instances and their lifecycle.
pub mod pool;
/// Agent catalog and the executor trait.
pub mod registry;
/// Single-attempt execution and the progress sink.
pub mod runner;
/// The scheduler: dispatch, completion, retry and cancellation.
pub mod scheduler;
/// Agent selection for unassigned tasks.
pub mod selector;
/// Parent/child task spawning.
pub mod spawner;
/// Eviction of expired terminal work.
pub mod sweeper;
/// Priority queue of pending tasks.
pub mod task_queue;
/// Task, instance and metrics types.
pub mod types;

pub use config::{
    AgentDefinition, CleanupConfig, HealthConfig, SchedulerConfig, StoreConfig, SwarmConfig,
};
pub use pool::{InstancePool, Recycled, RunOutcome};
pub use registry::{
    body_fn, AgentBody, AgentMetadata, AgentRegistry, ExecutionContext, ExecutionRequest,
};
pub use runner::{retry_delay, ProgressSink};
pub use scheduler::{SchedulerBuilder, SwarmScheduler};
pub use selector::{AgentSelector, KeywordSelector};
pub use sweeper::SweepReport;
pub use task_queue::{QueuedTask, TaskQueue};
pub use types::{
    AgentInstance, InstanceStatus, Priority, SwarmMetrics, SwarmTask, TaskRequest, TaskStatus,
};
