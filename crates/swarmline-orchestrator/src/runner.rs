use crate::config::SchedulerConfig;
use crate::registry::{AgentBody, ExecutionRequest};
use crate::scheduler::Shared;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarmline_core::{Payload, SwarmlineError, SwarmlineResult};
use swarmline_stream::{event_types, ExecutionHub};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Progress callback handed to an [`AgentBody`].
///
/// Everything emitted here lands in the execution's event buffer and is
/// fanned out to subscribers. Emitting after the execution reached a
/// terminal state returns an error the body may ignore.
#[derive(Clone)]
pub struct ProgressSink {
    hub: Arc<ExecutionHub>,
    execution_id: Uuid,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn new(hub: Arc<ExecutionHub>, execution_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            hub,
            execution_id,
            cancel,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Emit an arbitrary non-terminal event.
    pub fn emit(&self, event_type: &str, payload: Payload) -> SwarmlineResult<u64> {
        self.hub.emit(self.execution_id, event_type, payload)
    }

    /// Emit a `progress` event.
    pub fn progress(&self, payload: Payload) -> SwarmlineResult<u64> {
        self.emit(event_types::PROGRESS, payload)
    }

    /// Append to the execution's steps summary and emit a `step` event.
    pub fn step(&self, step: impl Into<String>) -> SwarmlineResult<u64> {
        self.hub.record_step(self.execution_id, step)
    }

    /// Record a generated-artifact reference and emit an `artifact` event.
    pub fn artifact(&self, reference: impl Into<String>) -> SwarmlineResult<u64> {
        self.hub.record_artifact(self.execution_id, reference)
    }

    /// Cancelled when the task is cancelled, its instance is recycled or
    /// the scheduler shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("execution_id", &self.execution_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Delay before retry number `retry_count + 1`: `base * 2^retry_count`,
/// capped, with up to 25% added jitter when enabled.
pub fn retry_delay(config: &SchedulerConfig, retry_count: u32) -> Duration {
    let delay = config
        .retry_backoff_base_ms
        .saturating_mul(2u64.saturating_pow(retry_count))
        .min(config.retry_backoff_max_ms);
    let jitter = if config.retry_jitter && delay >= 4 {
        rand::thread_rng().gen_range(0..=delay / 4)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}

/// One attempt of one task on one instance.
///
/// Runs the agent body under the execution timeout and the task's
/// cancellation token, then hands the outcome back to the scheduler, which
/// releases the instance and decides between completion, retry and failure.
pub(crate) struct ExecutionRunner {
    pub(crate) shared: Arc<Shared>,
    pub(crate) task_id: Uuid,
    pub(crate) instance_id: Uuid,
    pub(crate) body: Arc<dyn AgentBody>,
    pub(crate) request: ExecutionRequest,
    pub(crate) token: CancellationToken,
    pub(crate) timeout: Duration,
}

impl ExecutionRunner {
    pub(crate) async fn run(self) {
        let sink = ProgressSink::new(
            Arc::clone(&self.shared.hub),
            self.request.context.execution_id,
            self.token.clone(),
        );
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                Err(SwarmlineError::Cancelled("execution interrupted".to_string()))
            }
            result = tokio::time::timeout(self.timeout, self.body.execute(self.request, sink)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(SwarmlineError::ExecutionTimeout(self.timeout)),
                }
            }
        };
        let elapsed = started.elapsed();
        debug!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "Attempt finished"
        );
        self.shared
            .finalize(self.task_id, self.instance_id, outcome, elapsed);
    }
}
