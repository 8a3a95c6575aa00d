use crate::config::AgentDefinition;
use crate::runner::ProgressSink;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use swarmline_core::{Payload, SwarmlineError, SwarmlineResult};
use tracing::info;
use uuid::Uuid;

/// Static description of an executable agent capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub name: String,
    pub category: String,
    pub capabilities: Vec<String>,
    pub required_tools: Vec<String>,
    /// Per-instance concurrency limit.
    pub max_concurrent_tasks: usize,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl AgentMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: "general".to_string(),
            capabilities: Vec::new(),
            required_tools: Vec::new(),
            max_concurrent_tasks: 1,
            model: None,
            temperature: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }
}

/// Where an attempt is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub agent_name: String,
    pub instance_id: Uuid,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
    pub parent_id: Option<Uuid>,
    pub user_id: String,
}

/// One attempt handed to an [`AgentBody`].
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub description: String,
    pub input: Payload,
    pub context: ExecutionContext,
}

/// The logic that actually produces a task's result.
///
/// The scheduler only needs this shape: any implementation (model call,
/// browser automation, code execution) can sit behind it. Returning
/// [`SwarmlineError::ExecutionFailure`] or another transient error makes the
/// task eligible for retry; [`SwarmlineError::InvalidInput`] fails it
/// outright.
#[async_trait]
pub trait AgentBody: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> SwarmlineResult<serde_json::Value>;
}

struct FnBody<F>(F);

#[async_trait]
impl<F, Fut> AgentBody for FnBody<F>
where
    F: Fn(ExecutionRequest, ProgressSink) -> Fut + Send + Sync,
    Fut: Future<Output = SwarmlineResult<serde_json::Value>> + Send,
{
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> SwarmlineResult<serde_json::Value> {
        (self.0)(request, progress).await
    }
}

/// Wrap an async closure as an [`AgentBody`].
pub fn body_fn<F, Fut>(f: F) -> Arc<dyn AgentBody>
where
    F: Fn(ExecutionRequest, ProgressSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwarmlineResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnBody(f))
}

#[derive(Clone)]
struct RegisteredAgent {
    metadata: AgentMetadata,
    body: Arc<dyn AgentBody>,
}

/// Catalog of agents: name to metadata plus executor.
///
/// Built once at startup and injected into the scheduler. Runtime
/// (re-)registration is supported behind a read-write lock.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from declarative definitions, turning each into an
    /// executor with `factory` (keyed on the definition's `kind`).
    pub fn from_definitions<F>(definitions: &[AgentDefinition], factory: F) -> SwarmlineResult<Self>
    where
        F: Fn(&AgentDefinition) -> SwarmlineResult<Arc<dyn AgentBody>>,
    {
        let registry = Self::new();
        for def in definitions {
            let body = factory(def).map_err(|e| {
                SwarmlineError::Config(format!("agent '{}' (kind '{}'): {e}", def.name, def.kind))
            })?;
            registry.register(def.metadata(), body);
        }
        Ok(registry)
    }

    /// Register or replace an agent. Returns the previous metadata if any.
    pub fn register(&self, metadata: AgentMetadata, body: Arc<dyn AgentBody>) -> Option<AgentMetadata> {
        let name = metadata.name.clone();
        let previous = self
            .agents
            .write()
            .insert(name.clone(), RegisteredAgent { metadata, body })
            .map(|a| a.metadata);
        info!(agent = %name, replaced = previous.is_some(), "Agent registered");
        previous
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.agents.write().remove(name).is_some();
        if removed {
            info!(agent = %name, "Agent unregistered");
        }
        removed
    }

    pub fn metadata(&self, name: &str) -> Option<AgentMetadata> {
        self.agents.read().get(name).map(|a| a.metadata.clone())
    }

    pub fn body(&self, name: &str) -> Option<Arc<dyn AgentBody>> {
        self.agents.read().get(name).map(|a| Arc::clone(&a.body))
    }

    /// Metadata and executor from a single lookup.
    pub fn resolve(&self, name: &str) -> Option<(AgentMetadata, Arc<dyn AgentBody>)> {
        self.agents
            .read()
            .get(name)
            .map(|a| (a.metadata.clone(), Arc::clone(&a.body)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    /// All registered agents, sorted by name.
    pub fn candidates(&self) -> Vec<AgentMetadata> {
        let mut all: Vec<AgentMetadata> =
            self.agents.read().values().map(|a| a.metadata.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
