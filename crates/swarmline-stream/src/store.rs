use crate::types::{ExecutionStatus, PersistentExecution};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use swarmline_core::{SwarmlineError, SwarmlineResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

/// Optional durable backing for executions.
///
/// Writes go through [`StoreWriter`] and never block or fail the in-memory
/// path; reads are best-effort fallbacks for evicted executions.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, execution: &PersistentExecution) -> SwarmlineResult<()>;
    async fn update_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        partial_state: serde_json::Value,
    ) -> SwarmlineResult<()>;
    async fn load(&self, execution_id: Uuid) -> SwarmlineResult<Option<PersistentExecution>>;
    async fn list_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> SwarmlineResult<Vec<PersistentExecution>>;
}

/// File-based execution store (one JSON document per execution).
pub struct FileExecutionStore {
    dir: PathBuf,
}

impl FileExecutionStore {
    pub async fn new(dir: PathBuf) -> SwarmlineResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn execution_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write(&self, execution: &PersistentExecution) -> SwarmlineResult<()> {
        let json = serde_json::to_string_pretty(execution)?;
        tokio::fs::write(self.execution_path(execution.id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn create(&self, execution: &PersistentExecution) -> SwarmlineResult<()> {
        self.write(execution).await
    }

    async fn update_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        partial_state: serde_json::Value,
    ) -> SwarmlineResult<()> {
        let path = self.execution_path(execution_id);
        if !path.exists() {
            return Err(SwarmlineError::Store(format!(
                "execution {execution_id} was never created"
            )));
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut doc: serde_json::Value = serde_json::from_str(&data)?;
        if let (Some(doc), Some(partial)) = (doc.as_object_mut(), partial_state.as_object()) {
            for (key, value) in partial {
                doc.insert(key.clone(), value.clone());
            }
            doc.insert("status".to_string(), serde_json::to_value(status)?);
        }
        let execution: PersistentExecution = serde_json::from_value(doc)
            .map_err(|e| SwarmlineError::Store(format!("Failed to merge execution state: {e}")))?;
        self.write(&execution).await
    }

    async fn load(&self, execution_id: Uuid) -> SwarmlineResult<Option<PersistentExecution>> {
        let path = self.execution_path(execution_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let execution = serde_json::from_str(&data)
            .map_err(|e| SwarmlineError::Store(format!("Failed to parse execution: {e}")))?;
        Ok(Some(execution))
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> SwarmlineResult<Vec<PersistentExecution>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<PersistentExecution>(&data) {
                Ok(execution) if execution.user_id == user_id => found.push(execution),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable execution file"),
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Ok(found)
    }
}

/// A queued write for the durable store.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Create(Box<PersistentExecution>),
    UpdateStatus {
        execution_id: Uuid,
        status: ExecutionStatus,
        partial_state: serde_json::Value,
    },
}

/// Write-behind front for an [`ExecutionStore`].
///
/// A single writer task owns the store connection and applies operations in
/// submission order. Submitting never waits: a full queue drops the write.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<StoreOp>,
    store: Arc<dyn ExecutionStore>,
}

impl StoreWriter {
    /// Spawn the writer loop on `tracker`. It drains pending writes and exits
    /// once `shutdown` is cancelled.
    pub fn spawn(
        store: Arc<dyn ExecutionStore>,
        capacity: usize,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreOp>(capacity.max(1));
        let writer_store = store.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    op = rx.recv() => match op {
                        Some(op) => apply(writer_store.as_ref(), op).await,
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        while let Ok(op) = rx.try_recv() {
                            apply(writer_store.as_ref(), op).await;
                        }
                        break;
                    }
                }
            }
            debug!("Store writer stopped");
        });
        Self { tx, store }
    }

    /// Queue a write. Never blocks; failures are logged and ignored.
    pub fn submit(&self, op: StoreOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!(error = %e, "Execution store queue unavailable, dropping write");
        }
    }

    /// Direct read access for fallbacks.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }
}

async fn apply(store: &dyn ExecutionStore, op: StoreOp) {
    let result = match op {
        StoreOp::Create(execution) => store.create(&execution).await,
        StoreOp::UpdateStatus {
            execution_id,
            status,
            partial_state,
        } => {
            store
                .update_status(execution_id, status, partial_state)
                .await
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Execution store write failed");
    }
}
