use crate::buffer::{EventBuffer, Replay};
use crate::store::{StoreOp, StoreWriter};
use crate::types::{event_types, BufferedEvent, ExecutionStatus, PersistentExecution};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use swarmline_core::{payload, Payload, SwarmlineError, SwarmlineResult, Tombstones};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event buffer and fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Events retained per execution before the oldest are dropped.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
    /// Bounded queue size per subscriber. A full queue drops events.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Idle interval after which a subscriber receives a keepalive.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Deliver events to global subscribers when an execution has none.
    #[serde(default)]
    pub global_fallback: bool,
    /// Pending write-behind operations before store writes are dropped.
    #[serde(default = "default_store_queue_capacity")]
    pub store_queue_capacity: usize,
}

fn default_max_buffered_events() -> usize {
    1000
}
fn default_subscriber_queue_capacity() -> usize {
    256
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_store_queue_capacity() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: default_max_buffered_events(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            keepalive_secs: default_keepalive_secs(),
            global_fallback: false,
            store_queue_capacity: default_store_queue_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

/// Point-in-time view of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution: PersistentExecution,
    pub last_sequence: u64,
    pub first_retained: Option<u64>,
    pub buffered_events: usize,
    pub subscribers: usize,
}

pub(crate) struct Subscriber {
    tx: mpsc::Sender<BufferedEvent>,
    dropped: u64,
}

struct ExecutionEntry {
    execution: PersistentExecution,
    buffer: EventBuffer,
    subscribers: HashMap<u64, Subscriber>,
}

#[derive(Default)]
struct HubState {
    executions: HashMap<Uuid, ExecutionEntry>,
    global: HashMap<u64, Subscriber>,
    evicted: Tombstones,
}

impl HubState {
    fn entry(&self, id: Uuid) -> SwarmlineResult<&ExecutionEntry> {
        match self.executions.get(&id) {
            Some(entry) => Ok(entry),
            None => Err(self.missing(id)),
        }
    }

    fn entry_mut(&mut self, id: Uuid) -> SwarmlineResult<&mut ExecutionEntry> {
        if !self.executions.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.executions
            .get_mut(&id)
            .ok_or_else(|| SwarmlineError::not_found("execution", id))
    }

    fn missing(&self, id: Uuid) -> SwarmlineError {
        if self.evicted.contains(&id) {
            SwarmlineError::AlreadyTerminal(format!("execution {id} (evicted)"))
        } else {
            SwarmlineError::not_found("execution", id)
        }
    }
}

/// Owns every live [`PersistentExecution`], its event buffer and its
/// subscribers.
///
/// All mutation happens under one short-lived lock; no lock is held across
/// an await point. Delivery to subscribers is non-blocking.
pub struct ExecutionHub {
    config: StreamConfig,
    state: Mutex<HubState>,
    next_subscriber_id: AtomicU64,
    writer: Option<StoreWriter>,
}

impl ExecutionHub {
    /// Create an in-memory hub with no durable store.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HubState::default()),
            next_subscriber_id: AtomicU64::new(1),
            writer: None,
        }
    }

    /// Create a hub that writes execution state behind to `writer`.
    pub fn with_store(config: StreamConfig, writer: StoreWriter) -> Self {
        Self {
            writer: Some(writer),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register a new execution and return its id.
    pub fn create(&self, execution: PersistentExecution) -> Uuid {
        let id = execution.id;
        let entry = ExecutionEntry {
            buffer: EventBuffer::new(id, self.config.max_buffered_events),
            execution: execution.clone(),
            subscribers: HashMap::new(),
        };
        self.state.lock().executions.insert(id, entry);
        self.persist(StoreOp::Create(Box::new(execution)));
        debug!(execution_id = %id, "Execution created");
        id
    }

    /// Append an event and fan it out. Returns the assigned sequence number.
    ///
    /// Terminal event types must go through [`ExecutionHub::finish`].
    pub fn emit(
        &self,
        execution_id: Uuid,
        event_type: &str,
        payload: Payload,
    ) -> SwarmlineResult<u64> {
        if event_types::is_terminal(event_type) {
            return Err(SwarmlineError::InvalidInput(format!(
                "terminal event '{event_type}' must be emitted by finish()"
            )));
        }
        let mut state = self.state.lock();
        let entry = state.entry_mut(execution_id)?;
        if entry.execution.status.is_terminal() {
            return Err(SwarmlineError::AlreadyTerminal(format!(
                "execution {execution_id}"
            )));
        }
        let event = entry.buffer.push(event_type, payload);
        let sequence = event.sequence;
        Self::fan_out(&mut state, execution_id, event, self.config.global_fallback);
        Ok(sequence)
    }

    /// Transition a non-terminal execution to another non-terminal status.
    pub fn set_status(&self, execution_id: Uuid, status: ExecutionStatus) -> SwarmlineResult<()> {
        if status.is_terminal() {
            return Err(SwarmlineError::InvalidInput(format!(
                "terminal status '{status}' must be set by finish()"
            )));
        }
        let partial = {
            let mut state = self.state.lock();
            let entry = state.entry_mut(execution_id)?;
            let exec = &mut entry.execution;
            if exec.status.is_terminal() {
                return Err(SwarmlineError::AlreadyTerminal(format!(
                    "execution {execution_id}"
                )));
            }
            if status == ExecutionStatus::Running && exec.started_at.is_none() {
                exec.started_at = Some(Utc::now());
            }
            exec.status = status;
            exec.partial_state()
        };
        self.persist(StoreOp::UpdateStatus {
            execution_id,
            status,
            partial_state: partial,
        });
        Ok(())
    }

    /// Move an execution into a terminal status and emit the matching
    /// terminal event in the same critical section.
    pub fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> SwarmlineResult<u64> {
        let Some(event_type) = status.terminal_event() else {
            return Err(SwarmlineError::InvalidInput(format!(
                "status '{status}' is not terminal"
            )));
        };
        let (sequence, partial) = {
            let mut state = self.state.lock();
            let entry = state.entry_mut(execution_id)?;
            if entry.execution.status.is_terminal() {
                return Err(SwarmlineError::AlreadyTerminal(format!(
                    "execution {execution_id}"
                )));
            }
            let exec = &mut entry.execution;
            exec.status = status;
            exec.completed_at = Some(Utc::now());
            exec.result = result.clone();
            exec.error = error.clone();
            let partial = exec.partial_state();

            let mut body = Payload::new();
            if let Some(result) = result {
                body.insert("result".to_string(), result);
            }
            if let Some(error) = error {
                body.insert("error".to_string(), serde_json::Value::String(error));
            }
            let event = entry.buffer.push(event_type, body);
            let sequence = event.sequence;
            Self::fan_out(&mut state, execution_id, event, self.config.global_fallback);
            (sequence, partial)
        };
        info!(execution_id = %execution_id, status = %status, "Execution finished");
        self.persist(StoreOp::UpdateStatus {
            execution_id,
            status,
            partial_state: partial,
        });
        Ok(sequence)
    }

    /// Append a step to the summary and emit a `step` event.
    pub fn record_step(&self, execution_id: Uuid, step: impl Into<String>) -> SwarmlineResult<u64> {
        let step = step.into();
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(execution_id)?;
            if !entry.execution.status.is_terminal() {
                entry.execution.steps.push(step.clone());
            }
        }
        self.emit(execution_id, event_types::STEP, payload! { "step" => step })
    }

    /// Record a generated-artifact reference and emit an `artifact` event.
    pub fn record_artifact(
        &self,
        execution_id: Uuid,
        reference: impl Into<String>,
    ) -> SwarmlineResult<u64> {
        let reference = reference.into();
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(execution_id)?;
            if !entry.execution.status.is_terminal() {
                entry.execution.artifacts.push(reference.clone());
            }
        }
        self.emit(
            execution_id,
            event_types::ARTIFACT,
            payload! { "reference" => reference },
        )
    }

    /// Set the cancellation flag. Returns `false` if already terminal.
    pub fn request_cancel(&self, execution_id: Uuid) -> SwarmlineResult<bool> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(execution_id)?;
        if entry.execution.status.is_terminal() {
            return Ok(false);
        }
        entry.execution.cancel_requested = true;
        Ok(true)
    }

    pub fn is_cancel_requested(&self, execution_id: Uuid) -> bool {
        self.state
            .lock()
            .executions
            .get(&execution_id)
            .is_some_and(|e| e.execution.cancel_requested)
    }

    /// Snapshot of an in-memory execution.
    pub fn get(&self, execution_id: Uuid) -> SwarmlineResult<ExecutionSnapshot> {
        let state = self.state.lock();
        let entry = state.entry(execution_id)?;
        Ok(ExecutionSnapshot {
            execution: entry.execution.clone(),
            last_sequence: entry.buffer.last_sequence(),
            first_retained: entry.buffer.first_retained(),
            buffered_events: entry.buffer.len(),
            subscribers: entry.subscribers.len(),
        })
    }

    /// Load an execution from memory, falling back to the durable store.
    pub async fn load_execution(&self, execution_id: Uuid) -> SwarmlineResult<PersistentExecution> {
        let missing = {
            let state = self.state.lock();
            match state.entry(execution_id) {
                Ok(entry) => return Ok(entry.execution.clone()),
                Err(e) => e,
            }
        };
        if let Some(writer) = &self.writer {
            match writer.store().load(execution_id).await {
                Ok(Some(execution)) => return Ok(execution),
                Ok(None) => {}
                Err(e) => warn!(execution_id = %execution_id, error = %e, "Execution store read failed"),
            }
        }
        Err(missing)
    }

    /// Most recent executions for a user, merging memory and the store.
    pub async fn list_by_user(&self, user_id: &str, limit: usize) -> Vec<PersistentExecution> {
        let mut found: Vec<PersistentExecution> = {
            let state = self.state.lock();
            state
                .executions
                .values()
                .filter(|e| e.execution.user_id == user_id)
                .map(|e| e.execution.clone())
                .collect()
        };
        if let Some(writer) = &self.writer {
            match writer.store().list_by_user(user_id, limit).await {
                Ok(stored) => {
                    let known: HashSet<Uuid> = found.iter().map(|e| e.id).collect();
                    found.extend(stored.into_iter().filter(|e| !known.contains(&e.id)));
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "Execution store list failed"),
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        found
    }

    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.state.lock().executions.contains_key(&execution_id)
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().executions.len()
    }

    /// Live subscribers for one execution.
    pub fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.state
            .lock()
            .executions
            .get(&execution_id)
            .map_or(0, |e| e.subscribers.values().filter(|s| !s.tx.is_closed()).count())
    }

    /// Evict terminal executions completed before `cutoff` that have no
    /// live subscribers. Returns the evicted ids.
    pub fn evict_expired(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.state.lock();
        let expired: Vec<Uuid> = state
            .executions
            .iter_mut()
            .filter_map(|(id, entry)| {
                entry.subscribers.retain(|_, s| !s.tx.is_closed());
                let done_before_cutoff = entry.execution.status.is_terminal()
                    && entry.execution.completed_at.is_some_and(|at| at < cutoff);
                (done_before_cutoff && entry.subscribers.is_empty()).then_some(*id)
            })
            .collect();
        for id in &expired {
            state.executions.remove(id);
            state.evicted.insert(*id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted expired executions");
        }
        expired
    }

    /// Register a subscriber and snapshot the replay under one lock, so no
    /// event can fall between the backlog and the live queue.
    pub(crate) fn attach(
        &self,
        execution_id: Uuid,
        from_sequence: u64,
    ) -> SwarmlineResult<(Replay, Option<(u64, mpsc::Receiver<BufferedEvent>)>)> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(execution_id)?;
        let last_sequence = entry.buffer.last_sequence();
        if from_sequence > last_sequence {
            return Err(SwarmlineError::InvalidInput(format!(
                "from_sequence {from_sequence} is ahead of execution {execution_id} (last sequence {last_sequence})"
            )));
        }
        let replay = entry.buffer.replay_after(from_sequence);
        if entry.execution.status.is_terminal() {
            return Ok((replay, None));
        }
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        entry.subscribers.insert(id, Subscriber { tx, dropped: 0 });
        debug!(execution_id = %execution_id, subscriber = id, from_sequence, "Subscriber attached");
        Ok((replay, Some((id, rx))))
    }

    pub(crate) fn attach_global(&self) -> (u64, mpsc::Receiver<BufferedEvent>) {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .global
            .insert(id, Subscriber { tx, dropped: 0 });
        (id, rx)
    }

    pub(crate) fn detach(&self, execution_id: Option<Uuid>, subscriber_id: u64) {
        let mut state = self.state.lock();
        match execution_id {
            Some(id) => {
                if let Some(entry) = state.executions.get_mut(&id) {
                    entry.subscribers.remove(&subscriber_id);
                }
            }
            None => {
                state.global.remove(&subscriber_id);
            }
        }
        debug!(subscriber = subscriber_id, "Subscriber detached");
    }

    /// Retained events strictly between `after` and `before`, used by
    /// subscribers that lost events to overflow. `None` once the execution
    /// is gone.
    pub(crate) fn backfill(&self, execution_id: Uuid, after: u64, before: u64) -> Option<Replay> {
        let state = self.state.lock();
        state
            .executions
            .get(&execution_id)
            .map(|entry| entry.buffer.range(after, before))
    }

    fn fan_out(state: &mut HubState, execution_id: Uuid, event: BufferedEvent, global_fallback: bool) {
        let delivered_specific = state
            .executions
            .get_mut(&execution_id)
            .map(|entry| deliver(&mut entry.subscribers, execution_id, &event))
            .unwrap_or(0);
        if delivered_specific == 0 && global_fallback && !state.global.is_empty() {
            deliver(&mut state.global, execution_id, &event);
        }
    }

    fn persist(&self, op: StoreOp) {
        if let Some(writer) = &self.writer {
            writer.submit(op);
        }
    }
}

/// Push `event` to every subscriber without waiting. Returns how many
/// subscribers are still attached.
fn deliver(subscribers: &mut HashMap<u64, Subscriber>, execution_id: Uuid, event: &BufferedEvent) -> usize {
    subscribers.retain(|id, sub| match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            sub.dropped += 1;
            let err = SwarmlineError::SubscriberOverflow {
                execution_id,
                dropped: sub.dropped,
            };
            warn!(subscriber = *id, sequence = event.sequence, error = %err, "Dropping event for slow subscriber");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
    subscribers.len()
}
