//! Built-in demo executors, selected by an agent definition's `kind`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use swarmline_core::{payload, SwarmlineError, SwarmlineResult};
use swarmline_orchestrator::{AgentBody, AgentDefinition, ExecutionRequest, ProgressSink};

/// Returns the description and input it was given.
pub struct EchoBody;

#[async_trait]
impl AgentBody for EchoBody {
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> SwarmlineResult<serde_json::Value> {
        progress.step(format!("echo on {}", request.context.agent_name))?;
        Ok(serde_json::json!({
            "description": request.description,
            "input": request.input,
        }))
    }
}

/// Sleeps in `steps` slices, reporting progress after each.
pub struct SleepBody {
    duration: Duration,
    steps: u32,
}

#[async_trait]
impl AgentBody for SleepBody {
    async fn execute(
        &self,
        _request: ExecutionRequest,
        progress: ProgressSink,
    ) -> SwarmlineResult<serde_json::Value> {
        let slice = self.duration / self.steps;
        for done in 1..=self.steps {
            tokio::select! {
                _ = progress.cancellation().cancelled() => {
                    return Err(SwarmlineError::Cancelled("sleep interrupted".to_string()));
                }
                _ = tokio::time::sleep(slice) => {}
            }
            progress.progress(payload! { "pct" => done * 100 / self.steps })?;
        }
        Ok(serde_json::json!({ "slept_ms": self.duration.as_millis() as u64 }))
    }
}

/// Fails its first `failures` attempts, then succeeds.
pub struct FlakyBody {
    failures: u32,
}

#[async_trait]
impl AgentBody for FlakyBody {
    async fn execute(
        &self,
        request: ExecutionRequest,
        _progress: ProgressSink,
    ) -> SwarmlineResult<serde_json::Value> {
        let attempt = request.context.attempt;
        if attempt <= self.failures {
            return Err(SwarmlineError::ExecutionFailure(format!(
                "simulated failure on attempt {attempt}"
            )));
        }
        Ok(serde_json::json!({ "attempt": attempt }))
    }
}

fn option_u64(def: &AgentDefinition, key: &str, default: u64) -> SwarmlineResult<u64> {
    match def.options.get(key) {
        None => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            SwarmlineError::InvalidInput(format!("option '{key}' must be a non-negative integer"))
        }),
    }
}

/// Executor factory for [`swarmline_orchestrator::AgentRegistry::from_definitions`].
pub fn build(def: &AgentDefinition) -> SwarmlineResult<Arc<dyn AgentBody>> {
    match def.kind.as_str() {
        "echo" => Ok(Arc::new(EchoBody)),
        "sleep" => {
            let steps = option_u64(def, "steps", 4)?.clamp(1, 100);
            Ok(Arc::new(SleepBody {
                duration: Duration::from_millis(option_u64(def, "millis", 500)?),
                steps: u32::try_from(steps).unwrap_or(4),
            }))
        }
        "flaky" => Ok(Arc::new(FlakyBody {
            failures: u32::try_from(option_u64(def, "failures", 1)?).unwrap_or(u32::MAX),
        })),
        other => Err(SwarmlineError::InvalidInput(format!(
            "unknown agent kind '{other}'"
        ))),
    }
}

/// Agents used when no config file is present.
pub fn demo_agents() -> Vec<AgentDefinition> {
    let mut echo = AgentDefinition::new("echo", "echo");
    echo.capabilities = vec!["echo".into(), "repeat".into()];

    let mut sleeper = AgentDefinition::new("sleeper", "sleep");
    sleeper.capabilities = vec!["wait".into(), "sleep".into(), "slow".into()];

    let mut flaky = AgentDefinition::new("flaky", "flaky");
    flaky.capabilities = vec!["retry".into(), "flaky".into()];
    flaky.options.insert("failures".into(), serde_json::json!(1));

    vec![echo, sleeper, flaky]
}
