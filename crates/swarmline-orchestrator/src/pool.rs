use crate::config::HealthConfig;
use crate::registry::AgentMetadata;
use crate::types::{AgentInstance, InstanceStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use swarmline_core::{SwarmlineError, SwarmlineResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How an attempt ended, from the instance's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { elapsed_ms: u64 },
    Failed,
    /// Stopped by a cancel; counts neither as success nor as error.
    Cancelled,
}

/// An instance the health check took out of service.
#[derive(Debug, Clone, PartialEq)]
pub struct Recycled {
    pub instance_id: Uuid,
    pub agent_name: String,
    pub health_score: f64,
    /// Tasks still running on the old instance.
    pub in_flight: Vec<Uuid>,
    /// Fresh instance spawned in its place, if the agent is still registered.
    pub replacement: Option<Uuid>,
}

/// Live worker instances, keyed by id.
///
/// Every method assumes the caller holds the scheduler lock, so a task's
/// assignment and its instance's `current_tasks` change together.
#[derive(Debug)]
pub struct InstancePool {
    instances: HashMap<Uuid, AgentInstance>,
    max_per_agent: usize,
}

impl InstancePool {
    pub fn new(max_per_agent: usize) -> Self {
        Self {
            instances: HashMap::new(),
            max_per_agent: max_per_agent.max(1),
        }
    }

    /// Instances of `agent` that count against the per-agent cap.
    fn slots_used(&self, agent: &str) -> usize {
        self.instances
            .values()
            .filter(|i| i.agent_name == agent && i.status.holds_slot())
            .count()
    }

    pub fn can_spawn(&self, agent: &str) -> bool {
        self.slots_used(agent) < self.max_per_agent
    }

    /// Create a fresh instance (health 1.0) and bring it to `ready`.
    pub fn spawn(&mut self, metadata: &AgentMetadata) -> SwarmlineResult<Uuid> {
        if !self.can_spawn(&metadata.name) {
            return Err(SwarmlineError::AgentUnavailable(format!(
                "agent '{}' already has {} instance(s)",
                metadata.name, self.max_per_agent
            )));
        }
        let mut instance = AgentInstance::new(&metadata.name, metadata.max_concurrent_tasks);
        let id = instance.id;
        debug!(instance_id = %id, agent = %metadata.name, "Instance initializing");
        instance.status = InstanceStatus::Ready;
        self.instances.insert(id, instance);
        info!(instance_id = %id, agent = %metadata.name, "Instance spawned");
        Ok(id)
    }

    /// Pick a ready instance of `agent` with spare capacity: healthiest
    /// first, then least loaded.
    pub fn acquire(&self, agent: &str) -> Option<Uuid> {
        self.instances
            .values()
            .filter(|i| i.agent_name == agent && i.has_capacity())
            .max_by(|a, b| {
                a.health_score
                    .total_cmp(&b.health_score)
                    .then_with(|| b.current_tasks.len().cmp(&a.current_tasks.len()))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|i| i.id)
    }

    /// Record that `task_id` now runs on `instance_id`.
    pub fn assign(&mut self, instance_id: Uuid, task_id: Uuid) -> SwarmlineResult<()> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| SwarmlineError::not_found("instance", instance_id))?;
        if !instance.has_capacity() {
            return Err(SwarmlineError::AgentUnavailable(format!(
                "instance {instance_id} has no spare capacity"
            )));
        }
        instance.current_tasks.insert(task_id);
        instance.status = InstanceStatus::Busy;
        instance.last_active = Utc::now();
        Ok(())
    }

    /// Remove `task_id` from the instance and fold in the outcome.
    ///
    /// An emptied instance goes back to `ready`; an emptied terminating
    /// instance is removed. Returns `true` if the instance was removed.
    pub fn release(&mut self, instance_id: Uuid, task_id: Uuid, outcome: RunOutcome) -> bool {
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            return false;
        };
        instance.current_tasks.remove(&task_id);
        instance.last_active = Utc::now();
        match outcome {
            RunOutcome::Completed { elapsed_ms } => {
                instance.total_completed += 1;
                let n = instance.total_completed as f64;
                instance.avg_execution_ms += (elapsed_ms as f64 - instance.avg_execution_ms) / n;
            }
            RunOutcome::Failed => {
                instance.total_failed += 1;
                instance.error_count += 1;
            }
            RunOutcome::Cancelled => {}
        }
        if !instance.current_tasks.is_empty() {
            return false;
        }
        let status = instance.status;
        match status {
            InstanceStatus::Terminating => {
                self.remove_terminated(instance_id);
                true
            }
            InstanceStatus::Busy => {
                instance.status = InstanceStatus::Ready;
                false
            }
            _ => false,
        }
    }

    /// Start terminating an instance. Returns the tasks still running on it,
    /// which the caller must cancel. An instance with no tasks is removed
    /// immediately.
    pub fn begin_terminate(&mut self, instance_id: Uuid) -> SwarmlineResult<Vec<Uuid>> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| SwarmlineError::not_found("instance", instance_id))?;
        if instance.status == InstanceStatus::Terminating {
            return Ok(instance.current_tasks.iter().copied().collect());
        }
        instance.status = InstanceStatus::Terminating;
        let in_flight: Vec<Uuid> = instance.current_tasks.iter().copied().collect();
        info!(instance_id = %instance_id, agent = %instance.agent_name, in_flight = in_flight.len(), "Instance terminating");
        if in_flight.is_empty() {
            self.remove_terminated(instance_id);
        }
        Ok(in_flight)
    }

    fn remove_terminated(&mut self, instance_id: Uuid) {
        if let Some(mut instance) = self.instances.remove(&instance_id) {
            instance.status = InstanceStatus::Terminated;
            info!(
                instance_id = %instance_id,
                status = %instance.status,
                agent = %instance.agent_name,
                completed = instance.total_completed,
                failed = instance.total_failed,
                "Instance removed"
            );
        }
    }

    /// Hold an instance out of dispatch, or put it back.
    pub fn set_paused(&mut self, instance_id: Uuid, paused: bool) -> SwarmlineResult<()> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| SwarmlineError::not_found("instance", instance_id))?;
        match (paused, instance.status) {
            (true, s) if s.accepts_work() => instance.status = InstanceStatus::Paused,
            (false, InstanceStatus::Paused) => {
                instance.status = if instance.current_tasks.is_empty() {
                    InstanceStatus::Ready
                } else {
                    InstanceStatus::Busy
                };
            }
            (_, status) => {
                return Err(SwarmlineError::InvalidInput(format!(
                    "instance {instance_id} is {status}"
                )))
            }
        }
        Ok(())
    }

    /// One health-monitor pass at `now`.
    ///
    /// Idle instances decay by `decay_factor`; instances over the error
    /// threshold take `error_penalty` and stop accepting work. Instances that
    /// fall below `floor` are marked terminating in the same pass and
    /// returned, so a single crossing is reported exactly once.
    pub fn health_tick(&mut self, now: DateTime<Utc>, config: &HealthConfig) -> Vec<Recycled> {
        let idle_threshold = config.idle_threshold();
        let mut recycled = Vec::new();
        for instance in self.instances.values_mut() {
            if matches!(
                instance.status,
                InstanceStatus::Terminating | InstanceStatus::Terminated | InstanceStatus::Initializing
            ) {
                continue;
            }
            if instance.current_tasks.is_empty() && now - instance.last_active > idle_threshold {
                instance.health_score *= config.decay_factor;
                if instance.status == InstanceStatus::Ready {
                    instance.status = InstanceStatus::Idle;
                }
            }
            if instance.error_count > config.error_threshold {
                instance.health_score *= config.error_penalty;
                if instance.status.accepts_work() {
                    warn!(instance_id = %instance.id, errors = instance.error_count, "Instance error threshold exceeded");
                    instance.status = InstanceStatus::Error;
                }
            }
            if instance.health_score < config.floor {
                instance.status = InstanceStatus::Terminating;
                recycled.push(Recycled {
                    instance_id: instance.id,
                    agent_name: instance.agent_name.clone(),
                    health_score: instance.health_score,
                    in_flight: instance.current_tasks.iter().copied().collect(),
                    replacement: None,
                });
            }
        }
        for r in &recycled {
            if r.in_flight.is_empty() {
                self.remove_terminated(r.instance_id);
            }
        }
        recycled
    }

    pub fn get(&self, instance_id: Uuid) -> Option<&AgentInstance> {
        self.instances.get(&instance_id)
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, instance_id: Uuid) -> Option<&mut AgentInstance> {
        self.instances.get_mut(&instance_id)
    }

    /// Snapshot filtered by agent and status, oldest first.
    pub fn list(&self, agent: Option<&str>, status: Option<InstanceStatus>) -> Vec<AgentInstance> {
        let mut found: Vec<AgentInstance> = self
            .instances
            .values()
            .filter(|i| agent.map_or(true, |a| i.agent_name == a))
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Ids of every instance belonging to `agent`.
    pub fn instances_of(&self, agent: &str) -> Vec<Uuid> {
        self.instances
            .values()
            .filter(|i| i.agent_name == agent)
            .map(|i| i.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
