use crate::config::SwarmConfig;
use crate::pool::{InstancePool, RunOutcome};
use crate::registry::{AgentBody, AgentMetadata, AgentRegistry, ExecutionContext, ExecutionRequest};
use crate::runner::{retry_delay, ExecutionRunner};
use crate::selector::{AgentSelector, KeywordSelector};
use crate::task_queue::{QueuedTask, TaskQueue};
use crate::types::{
    AgentInstance, InstanceStatus, Priority, SwarmMetrics, SwarmTask, TaskRequest, TaskStatus,
};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmline_core::{payload, Payload, SwarmlineError, SwarmlineResult, Tombstones};
use swarmline_stream::{
    event_types, EventStream, ExecutionHub, ExecutionSnapshot, ExecutionStatus, ExecutionStore,
    PersistentExecution, StoreWriter,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) cancelled: u64,
    pub(crate) retried: u64,
}

/// Everything the dispatcher, runners and background loops mutate.
/// Guarded by a single mutex that is never held across an await.
pub(crate) struct SchedulerState {
    pub(crate) tasks: HashMap<Uuid, SwarmTask>,
    pub(crate) queue: TaskQueue,
    pub(crate) pool: InstancePool,
    /// Cancellation handle per running task.
    pub(crate) running: HashMap<Uuid, CancellationToken>,
    pub(crate) counters: Counters,
    pub(crate) evicted: Tombstones,
    pub(crate) paused: bool,
}

impl SchedulerState {
    pub(crate) fn task(&self, task_id: Uuid) -> SwarmlineResult<&SwarmTask> {
        match self.tasks.get(&task_id) {
            Some(task) => Ok(task),
            None if self.evicted.contains(&task_id) => {
                Err(SwarmlineError::AlreadyTerminal(format!("task {task_id} (evicted)")))
            }
            None => Err(SwarmlineError::not_found("task", task_id)),
        }
    }
}

enum Assignment {
    Launched(ExecutionRunner),
    /// The agent has no free instance and cannot spawn one yet.
    Deferred,
    /// Cancelled or otherwise no longer pending.
    Skipped,
    Unavailable(SwarmlineError),
}

enum Decision {
    Complete(serde_json::Value),
    Retry(SwarmlineError),
    Fail(SwarmlineError),
    Cancel(Option<String>),
}

pub(crate) struct Shared {
    pub(crate) config: SwarmConfig,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) registry: Arc<AgentRegistry>,
    selector: Arc<dyn AgentSelector>,
    pub(crate) hub: Arc<ExecutionHub>,
    pub(crate) wakeup: Notify,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown: CancellationToken,
    store_tracker: TaskTracker,
    store_shutdown: CancellationToken,
    started: AtomicBool,
}

impl Shared {
    /// Create the task and its execution, and queue it.
    fn enqueue(&self, request: TaskRequest) -> SwarmlineResult<Uuid> {
        if request.description.trim().is_empty() {
            return Err(SwarmlineError::InvalidInput(
                "task description must not be empty".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(SwarmlineError::InvalidInput(
                "scheduler is shut down".to_string(),
            ));
        }

        let mut st = self.state.lock();
        let depth = match request.parent_id {
            Some(parent_id) => self.check_parent(&st, parent_id)?,
            None => 0,
        };

        let execution = PersistentExecution::new(
            request.user_id.clone(),
            request.description.clone(),
            request.mode.clone(),
        );
        let execution_id = self.hub.create(execution);
        let task_id = Uuid::new_v4();
        let entry = st.queue.push(task_id, request.priority);
        let task = SwarmTask {
            id: task_id,
            description: request.description,
            input: request.input,
            priority: request.priority,
            status: TaskStatus::Pending,
            preferred_agent: request.preferred_agent,
            assigned_agent: None,
            assigned_instance: None,
            parent_id: request.parent_id,
            subtask_ids: Vec::new(),
            depth,
            execution_id,
            user_id: request.user_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.config.scheduler.default_max_retries),
            execution_time_ms: None,
            cancel_requested: false,
            queue_seq: entry.seq,
        };
        let queued = payload! {
            "task_id" => task_id.to_string(),
            "priority" => task.priority.value(),
            "preferred_agent" => task.preferred_agent.clone(),
        };
        if let Some(parent) = task.parent_id.and_then(|id| st.tasks.get_mut(&id)) {
            parent.subtask_ids.push(task_id);
        }
        info!(
            task_id = %task_id,
            execution_id = %execution_id,
            priority = %task.priority,
            parent = ?task.parent_id,
            "Task submitted"
        );
        st.tasks.insert(task_id, task);
        st.counters.submitted += 1;
        self.emit_quiet(execution_id, event_types::QUEUED, queued);
        drop(st);

        self.wakeup.notify_one();
        Ok(task_id)
    }

    /// Pop and launch ready tasks until the queue is empty, the global cap
    /// is reached, or dispatch is paused. Never waits on task execution.
    async fn dispatch_ready(self: &Arc<Self>) {
        let limit = self.config.scheduler.max_concurrent_tasks;
        let mut deferred: Vec<QueuedTask> = Vec::new();
        loop {
            let (entry, preferred, selection_input) = {
                let mut st = self.state.lock();
                if st.paused {
                    break;
                }
                if st.running.len() >= limit {
                    if !st.queue.is_empty() {
                        let err = SwarmlineError::QueueBackpressure {
                            running: st.running.len(),
                            limit,
                        };
                        debug!(error = %err, "Dispatch waiting for capacity");
                    }
                    break;
                }
                let Some(entry) = st.queue.pop_ready(Instant::now()) else {
                    break;
                };
                let Some(task) = st.tasks.get(&entry.task_id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    debug!(task_id = %entry.task_id, status = %task.status, "Skipping dequeued task");
                    continue;
                }
                let selection_input = match task.preferred_agent {
                    Some(_) => None,
                    None => Some((task.description.clone(), task.input.clone())),
                };
                (entry, task.preferred_agent.clone(), selection_input)
            };

            let agent = match (preferred, selection_input) {
                (Some(name), _) => Some(name),
                (None, Some((description, input))) => {
                    let candidates = self.registry.candidates();
                    self.selector.select(&description, &input, &candidates).await
                }
                (None, None) => None,
            };
            let Some(agent) = agent else {
                self.fail_permanently(
                    entry.task_id,
                    SwarmlineError::AgentUnavailable(
                        "no registered agent matches the task".to_string(),
                    ),
                );
                continue;
            };

            match self.assign(entry, &agent) {
                Assignment::Launched(runner) => {
                    self.tracker.spawn(runner.run());
                }
                Assignment::Deferred => {
                    debug!(task_id = %entry.task_id, agent = %agent, "Agent at capacity, deferring");
                    deferred.push(entry);
                }
                Assignment::Skipped => {}
                Assignment::Unavailable(err) => self.fail_permanently(entry.task_id, err),
            }
        }

        if !deferred.is_empty() {
            let mut st = self.state.lock();
            for entry in deferred {
                st.queue.requeue(entry);
            }
        }
    }

    /// Bind a pending task to an instance of `agent` and build its runner.
    fn assign(self: &Arc<Self>, entry: QueuedTask, agent: &str) -> Assignment {
        let task_id = entry.task_id;
        let mut st = self.state.lock();
        match st.tasks.get(&task_id) {
            Some(task) if task.status == TaskStatus::Pending => {}
            _ => return Assignment::Skipped,
        }
        if st.running.len() >= self.config.scheduler.max_concurrent_tasks {
            return Assignment::Deferred;
        }
        let Some((metadata, body)) = self.registry.resolve(agent) else {
            return Assignment::Unavailable(SwarmlineError::AgentUnavailable(format!(
                "agent '{agent}' is not registered"
            )));
        };
        let instance_id = match st.pool.acquire(agent) {
            Some(id) => id,
            None if st.pool.can_spawn(agent) => match st.pool.spawn(&metadata) {
                Ok(id) => id,
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Instance spawn failed");
                    return Assignment::Deferred;
                }
            },
            None => return Assignment::Deferred,
        };
        if let Err(e) = st.pool.assign(instance_id, task_id) {
            warn!(instance_id = %instance_id, error = %e, "Instance assignment failed");
            return Assignment::Deferred;
        }

        let token = self.shutdown.child_token();
        st.running.insert(task_id, token.clone());
        let Some(task) = st.tasks.get_mut(&task_id) else {
            return Assignment::Skipped;
        };
        task.status = TaskStatus::Running;
        task.assigned_agent = Some(agent.to_string());
        task.assigned_instance = Some(instance_id);
        task.started_at.get_or_insert_with(Utc::now);
        let attempt = task.retry_count + 1;
        let execution_id = task.execution_id;
        let request = ExecutionRequest {
            description: task.description.clone(),
            input: task.input.clone(),
            context: ExecutionContext {
                task_id,
                execution_id,
                agent_name: agent.to_string(),
                instance_id,
                attempt,
                parent_id: task.parent_id,
                user_id: task.user_id.clone(),
            },
        };

        if let Err(e) = self.hub.set_status(execution_id, ExecutionStatus::Running) {
            debug!(execution_id = %execution_id, error = %e, "Execution status not updated");
        }
        self.emit_quiet(
            execution_id,
            event_types::STARTED,
            payload! {
                "agent" => agent,
                "instance_id" => instance_id.to_string(),
                "attempt" => attempt,
            },
        );
        info!(task_id = %task_id, agent = %agent, instance_id = %instance_id, attempt, "Task dispatched");

        Assignment::Launched(ExecutionRunner {
            shared: Arc::clone(self),
            task_id,
            instance_id,
            body,
            request,
            token,
            timeout: self.config.scheduler.execution_timeout(),
        })
    }

    /// Fold an attempt's outcome into task, instance and execution state,
    /// then wake the dispatcher for the capacity just freed.
    pub(crate) fn finalize(
        &self,
        task_id: Uuid,
        instance_id: Uuid,
        outcome: SwarmlineResult<serde_json::Value>,
        elapsed: Duration,
    ) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut st = self.state.lock();
        st.running.remove(&task_id);

        let decision = match (outcome, st.tasks.get(&task_id)) {
            (_, None) => Decision::Cancel(None),
            (Ok(value), Some(_)) => Decision::Complete(value),
            (Err(_), Some(task)) if task.cancel_requested => Decision::Cancel(None),
            (Err(_), Some(_)) if self.shutdown.is_cancelled() => {
                Decision::Cancel(Some("scheduler shut down".to_string()))
            }
            (Err(e), Some(task)) if e.is_transient() && task.retry_count < task.max_retries => {
                Decision::Retry(e)
            }
            (Err(e), Some(_)) => Decision::Fail(e),
        };

        let run_outcome = match &decision {
            Decision::Complete(_) => RunOutcome::Completed { elapsed_ms },
            Decision::Cancel(_) => RunOutcome::Cancelled,
            Decision::Retry(SwarmlineError::Cancelled(_)) => RunOutcome::Cancelled,
            Decision::Retry(_) | Decision::Fail(_) => RunOutcome::Failed,
        };
        st.pool.release(instance_id, task_id, run_outcome);

        let scheduler = &self.config.scheduler;
        let SchedulerState {
            tasks,
            queue,
            counters,
            ..
        } = &mut *st;
        let Some(task) = tasks.get_mut(&task_id) else {
            drop(st);
            self.wakeup.notify_one();
            return;
        };
        let execution_id = task.execution_id;

        match decision {
            Decision::Complete(value) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.execution_time_ms = Some(elapsed_ms);
                task.result = Some(value.clone());
                task.error = None;
                counters.completed += 1;
                info!(task_id = %task_id, elapsed_ms, "Task completed");
                self.finish_quiet(execution_id, ExecutionStatus::Completed, Some(value), None);
            }
            Decision::Retry(err) => {
                let delay = retry_delay(scheduler, task.retry_count);
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
                task.assigned_instance = None;
                task.error = Some(err.to_string());
                queue.push_delayed(
                    QueuedTask {
                        task_id,
                        priority: task.priority,
                        seq: task.queue_seq,
                    },
                    Instant::now() + delay,
                );
                counters.retried += 1;
                warn!(
                    task_id = %task_id,
                    retry = task.retry_count,
                    max_retries = task.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task attempt failed, retrying"
                );
                if let Err(e) = self.hub.set_status(execution_id, ExecutionStatus::Pending) {
                    debug!(execution_id = %execution_id, error = %e, "Execution status not updated");
                }
                self.emit_quiet(
                    execution_id,
                    event_types::RETRYING,
                    payload! {
                        "retry" => task.retry_count,
                        "max_retries" => task.max_retries,
                        "delay_ms" => delay.as_millis() as u64,
                        "error" => err.to_string(),
                    },
                );
            }
            Decision::Fail(err) => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.error = Some(err.to_string());
                counters.failed += 1;
                warn!(task_id = %task_id, error = %err, kind = err.kind(), "Task failed");
                self.finish_quiet(execution_id, ExecutionStatus::Failed, None, Some(err.to_string()));
            }
            Decision::Cancel(reason) => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                task.error = reason.clone();
                counters.cancelled += 1;
                info!(task_id = %task_id, "Task cancelled");
                self.finish_quiet(execution_id, ExecutionStatus::Cancelled, None, reason);
            }
        }
        drop(st);
        self.wakeup.notify_one();
    }

    /// Fail a pending task without running it.
    fn fail_permanently(&self, task_id: Uuid, err: SwarmlineError) {
        let mut st = self.state.lock();
        let Some(task) = st.tasks.get_mut(&task_id) else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(err.to_string());
        let execution_id = task.execution_id;
        st.counters.failed += 1;
        warn!(task_id = %task_id, error = %err, "Task failed before dispatch");
        self.finish_quiet(execution_id, ExecutionStatus::Failed, None, Some(err.to_string()));
    }

    fn cancel(&self, task_id: Uuid) -> SwarmlineResult<bool> {
        let mut st = self.state.lock();
        let status = st.task(task_id)?.status;
        match status {
            TaskStatus::Pending => {
                let SchedulerState {
                    tasks, counters, ..
                } = &mut *st;
                let Some(task) = tasks.get_mut(&task_id) else {
                    return Ok(false);
                };
                task.status = TaskStatus::Cancelled;
                task.cancel_requested = true;
                task.completed_at = Some(Utc::now());
                counters.cancelled += 1;
                let execution_id = task.execution_id;
                info!(task_id = %task_id, "Pending task cancelled");
                self.request_cancel_quiet(execution_id);
                self.finish_quiet(execution_id, ExecutionStatus::Cancelled, None, None);
                Ok(true)
            }
            TaskStatus::Running => {
                let execution_id = {
                    let Some(task) = st.tasks.get_mut(&task_id) else {
                        return Ok(false);
                    };
                    task.cancel_requested = true;
                    task.execution_id
                };
                if let Some(token) = st.running.get(&task_id) {
                    token.cancel();
                }
                self.request_cancel_quiet(execution_id);
                info!(task_id = %task_id, "Cancellation requested for running task");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn metrics(&self) -> SwarmMetrics {
        let st = self.state.lock();
        let pending = st
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        let agents_active: HashSet<&str> = st
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.assigned_agent.as_deref())
            .collect();
        SwarmMetrics {
            submitted: st.counters.submitted,
            completed: st.counters.completed,
            failed: st.counters.failed,
            cancelled: st.counters.cancelled,
            retried: st.counters.retried,
            active: st.running.len(),
            pending,
            agents_registered: self.registry.len(),
            agents_active: agents_active.len(),
            instances: st.pool.len(),
        }
    }

    /// Cancel the running tasks of a terminating instance. Interrupted tasks
    /// go through the normal retry policy.
    pub(crate) fn interrupt(&self, st: &SchedulerState, tasks: &[Uuid]) {
        for task_id in tasks {
            if let Some(token) = st.running.get(task_id) {
                token.cancel();
            }
        }
    }

    fn emit_quiet(&self, execution_id: Uuid, event_type: &str, payload: Payload) {
        if let Err(e) = self.hub.emit(execution_id, event_type, payload) {
            debug!(execution_id = %execution_id, event = event_type, error = %e, "Event not emitted");
        }
    }

    fn request_cancel_quiet(&self, execution_id: Uuid) {
        if let Err(e) = self.hub.request_cancel(execution_id) {
            debug!(execution_id = %execution_id, error = %e, "Cancel flag not set");
        }
    }

    fn finish_quiet(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if let Err(e) = self.hub.finish(execution_id, status, result, error) {
            debug!(execution_id = %execution_id, error = %e, "Execution not finished");
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    info!("Dispatcher started");
    loop {
        shared.dispatch_ready().await;
        let wake_at = shared.state.lock().queue.next_wakeup();
        let retry_due = async {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wakeup.notified() => {}
            _ = retry_due => {}
        }
    }
    info!("Dispatcher stopped");
}

/// Builder for [`SwarmScheduler`].
pub struct SchedulerBuilder {
    config: SwarmConfig,
    registry: Option<Arc<AgentRegistry>>,
    selector: Option<Arc<dyn AgentSelector>>,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl SchedulerBuilder {
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Selector used for tasks without a preferred agent. Defaults to
    /// [`KeywordSelector`].
    pub fn with_selector(mut self, selector: Arc<dyn AgentSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Durable store written behind by a dedicated writer task.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and assemble the scheduler.
    ///
    /// Must be called inside a Tokio runtime when a store is configured,
    /// since the store writer is spawned here.
    pub fn build(self) -> SwarmlineResult<SwarmScheduler> {
        self.config.validate()?;
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let store_tracker = TaskTracker::new();
        let store_shutdown = CancellationToken::new();

        let hub = match self.store {
            Some(store) => {
                let writer = StoreWriter::spawn(
                    store,
                    self.config.stream.store_queue_capacity,
                    &store_tracker,
                    store_shutdown.clone(),
                );
                ExecutionHub::with_store(self.config.stream.clone(), writer)
            }
            None => ExecutionHub::new(self.config.stream.clone()),
        };

        let state = SchedulerState {
            tasks: HashMap::new(),
            queue: TaskQueue::new(),
            pool: InstancePool::new(self.config.scheduler.max_instances_per_agent),
            running: HashMap::new(),
            counters: Counters::default(),
            evicted: Tombstones::default(),
            paused: false,
        };

        Ok(SwarmScheduler {
            shared: Arc::new(Shared {
                config: self.config,
                state: Mutex::new(state),
                registry: self.registry.unwrap_or_default(),
                selector: self
                    .selector
                    .unwrap_or_else(|| Arc::new(KeywordSelector::new())),
                hub: Arc::new(hub),
                wakeup: Notify::new(),
                tracker,
                shutdown,
                store_tracker,
                store_shutdown,
                started: AtomicBool::new(false),
            }),
        })
    }
}

/// The task scheduler: priority queue, instance pool, dispatcher, runners,
/// health monitor and cleanup sweeper behind one handle.
///
/// Cloning is cheap and every clone drives the same scheduler.
///
/// ```no_run
/// use std::sync::Arc;
/// use swarmline_orchestrator::{body_fn, AgentMetadata, AgentRegistry, Priority, SwarmConfig, SwarmScheduler};
///
/// # async fn demo() -> swarmline_core::SwarmlineResult<()> {
/// let registry = Arc::new(AgentRegistry::new());
/// registry.register(
///     AgentMetadata::new("echo"),
///     body_fn(|req, _progress| async move { Ok(serde_json::json!(req.description)) }),
/// );
/// let scheduler = SwarmScheduler::builder(SwarmConfig::default())
///     .with_registry(registry)
///     .build()?;
/// scheduler.start();
/// let task_id = scheduler.submit_task("say hi", Default::default(), Priority::NORMAL, Some("echo"))?;
/// let task = scheduler.wait_for_terminal(task_id).await?;
/// assert_eq!(task.result, Some(serde_json::json!("say hi")));
/// scheduler.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SwarmScheduler {
    pub(crate) shared: Arc<Shared>,
}

impl SwarmScheduler {
    pub fn builder(config: SwarmConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            registry: None,
            selector: None,
            store: None,
        }
    }

    /// In-memory scheduler over `registry` with the default selector.
    pub fn new(config: SwarmConfig, registry: Arc<AgentRegistry>) -> SwarmlineResult<Self> {
        Self::builder(config).with_registry(registry).build()
    }

    /// Spawn the dispatcher, health monitor and cleanup sweeper. Calling it
    /// again has no effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.shared;
        shared.tracker.spawn(dispatch_loop(Arc::clone(shared)));
        shared
            .tracker
            .spawn(crate::monitor::health_loop(Arc::clone(shared)));
        shared
            .tracker
            .spawn(crate::sweeper::cleanup_loop(Arc::clone(shared)));
        info!(
            max_concurrent_tasks = shared.config.scheduler.max_concurrent_tasks,
            agents = shared.registry.len(),
            "Scheduler started"
        );
    }

    /// Stop the loops, cancel running work, join everything, cancel what is
    /// still queued and flush the durable store.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        info!("Scheduler shutting down");
        shared.shutdown.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;

        {
            let mut st = shared.state.lock();
            let SchedulerState {
                tasks, counters, ..
            } = &mut *st;
            for task in tasks.values_mut().filter(|t| t.status == TaskStatus::Pending) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                task.error = Some("scheduler shut down".to_string());
                counters.cancelled += 1;
                shared.finish_quiet(
                    task.execution_id,
                    ExecutionStatus::Cancelled,
                    None,
                    task.error.clone(),
                );
            }
        }

        shared.store_shutdown.cancel();
        shared.store_tracker.close();
        shared.store_tracker.wait().await;
        info!("Scheduler stopped");
    }

    /// Enqueue a task. Returns immediately with its id.
    pub fn submit_task(
        &self,
        description: impl Into<String>,
        input: Payload,
        priority: Priority,
        preferred_agent: Option<&str>,
    ) -> SwarmlineResult<Uuid> {
        let mut request = TaskRequest::new(description)
            .with_input(input)
            .with_priority(priority);
        request.preferred_agent = preferred_agent.map(str::to_string);
        self.submit_request(request)
    }

    /// Enqueue a task described by a full [`TaskRequest`].
    pub fn submit_request(&self, request: TaskRequest) -> SwarmlineResult<Uuid> {
        self.shared.enqueue(request)
    }

    /// Cancel a task. Pending tasks are cancelled immediately; running
    /// tasks are signalled and stop at their next await point. Returns
    /// `false` if the task is already terminal.
    pub fn cancel_task(&self, task_id: Uuid) -> SwarmlineResult<bool> {
        self.shared.cancel(task_id)
    }

    pub fn get_task_status(&self, task_id: Uuid) -> SwarmlineResult<SwarmTask> {
        self.shared.state.lock().task(task_id).cloned()
    }

    /// Tasks still in memory, oldest first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<SwarmTask> {
        let st = self.shared.state.lock();
        let mut tasks: Vec<SwarmTask> = st
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.queue_seq));
        tasks
    }

    /// Wait until the task is terminal and return its final state.
    pub async fn wait_for_terminal(&self, task_id: Uuid) -> SwarmlineResult<SwarmTask> {
        let execution_id = self.get_task_status(task_id)?.execution_id;
        let mut events = self.subscribe(execution_id, 0)?;
        while events.next().await.is_some() {}
        self.get_task_status(task_id)
    }

    /// Replay-then-follow stream of an execution's events.
    pub fn subscribe(&self, execution_id: Uuid, from_sequence: u64) -> SwarmlineResult<EventStream> {
        self.shared.hub.subscribe(execution_id, from_sequence)
    }

    /// [`SwarmScheduler::subscribe`] addressed by task id.
    pub fn subscribe_task(&self, task_id: Uuid, from_sequence: u64) -> SwarmlineResult<EventStream> {
        let execution_id = self.get_task_status(task_id)?.execution_id;
        self.subscribe(execution_id, from_sequence)
    }

    /// Execution snapshot, falling back to the durable store after eviction.
    pub async fn get_execution(&self, execution_id: Uuid) -> SwarmlineResult<ExecutionSnapshot> {
        match self.shared.hub.get(execution_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(_) => {
                let execution = self.shared.hub.load_execution(execution_id).await?;
                Ok(ExecutionSnapshot {
                    execution,
                    last_sequence: 0,
                    first_retained: None,
                    buffered_events: 0,
                    subscribers: 0,
                })
            }
        }
    }

    pub async fn list_executions_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Vec<PersistentExecution> {
        self.shared.hub.list_by_user(user_id, limit).await
    }

    pub fn get_metrics(&self) -> SwarmMetrics {
        self.shared.metrics()
    }

    pub fn list_agent_instances(
        &self,
        agent_name: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Vec<AgentInstance> {
        self.shared.state.lock().pool.list(agent_name, status)
    }

    /// Spawn an extra instance of a registered agent.
    pub fn spawn_instance(&self, agent_name: &str) -> SwarmlineResult<Uuid> {
        let metadata = self
            .shared
            .registry
            .metadata(agent_name)
            .ok_or_else(|| SwarmlineError::not_found("agent", agent_name))?;
        let id = self.shared.state.lock().pool.spawn(&metadata)?;
        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// Terminate an instance. Its running tasks are cancelled and retried
    /// elsewhere per the retry policy; the instance is removed once they
    /// have drained. Returns the interrupted task ids.
    pub fn terminate_instance(&self, instance_id: Uuid) -> SwarmlineResult<Vec<Uuid>> {
        let mut st = self.shared.state.lock();
        let in_flight = st.pool.begin_terminate(instance_id)?;
        self.shared.interrupt(&st, &in_flight);
        Ok(in_flight)
    }

    /// Hold an instance out of dispatch; its running tasks continue.
    pub fn pause_instance(&self, instance_id: Uuid) -> SwarmlineResult<()> {
        self.shared.state.lock().pool.set_paused(instance_id, true)
    }

    pub fn resume_instance(&self, instance_id: Uuid) -> SwarmlineResult<()> {
        self.shared.state.lock().pool.set_paused(instance_id, false)?;
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Register or replace an agent at runtime.
    pub fn register_agent(
        &self,
        metadata: AgentMetadata,
        body: Arc<dyn AgentBody>,
    ) -> Option<AgentMetadata> {
        let previous = self.shared.registry.register(metadata, body);
        self.shared.wakeup.notify_one();
        previous
    }

    /// Remove an agent and terminate its instances.
    pub fn unregister_agent(&self, name: &str) -> bool {
        if !self.shared.registry.unregister(name) {
            return false;
        }
        let mut st = self.shared.state.lock();
        for instance_id in st.pool.instances_of(name) {
            if let Ok(in_flight) = st.pool.begin_terminate(instance_id) {
                self.shared.interrupt(&st, &in_flight);
            }
        }
        true
    }

    /// Stop pulling new work from the queue. Running tasks continue.
    pub fn pause_dispatch(&self) {
        self.shared.state.lock().paused = true;
        info!("Dispatch paused");
    }

    pub fn resume_dispatch(&self) {
        self.shared.state.lock().paused = false;
        self.shared.wakeup.notify_one();
        info!("Dispatch resumed");
    }

    pub fn is_dispatch_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn hub(&self) -> &Arc<ExecutionHub> {
        &self.shared.hub
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.shared.config
    }
}
