use crate::scheduler::{SchedulerState, Shared, SwarmScheduler};
use crate::types::{default_user, TaskRequest};
use swarmline_core::{SwarmlineError, SwarmlineResult};
use uuid::Uuid;

impl Shared {
    /// Validate a parent for a new subtask and return the child's depth.
    pub(crate) fn check_parent(&self, st: &SchedulerState, parent_id: Uuid) -> SwarmlineResult<u32> {
        let parent = st.task(parent_id)?;
        if parent.is_terminal() {
            return Err(SwarmlineError::AlreadyTerminal(format!("task {parent_id}")));
        }
        let depth = parent.depth + 1;
        let limits = &self.config.scheduler;
        if depth > limits.max_subtask_depth {
            return Err(SwarmlineError::InvalidInput(format!(
                "subtask depth {depth} exceeds the limit of {}",
                limits.max_subtask_depth
            )));
        }
        if parent.subtask_ids.len() >= limits.max_subtasks_per_task {
            return Err(SwarmlineError::InvalidInput(format!(
                "task {parent_id} already has {} subtasks",
                parent.subtask_ids.len()
            )));
        }
        Ok(depth)
    }
}

impl SwarmScheduler {
    /// Submit a child of a non-terminal task. The child is scheduled
    /// independently; the parent's lifecycle does not wait on it. A request
    /// without an explicit user inherits the parent's.
    pub fn submit_subtask(&self, parent_id: Uuid, request: TaskRequest) -> SwarmlineResult<Uuid> {
        let mut request = request.with_parent(parent_id);
        if request.user_id == default_user() {
            if let Ok(parent) = self.get_task_status(parent_id) {
                request.user_id = parent.user_id;
            }
        }
        self.submit_request(request)
    }

    /// Ids of a task's subtasks, in submission order.
    pub fn subtasks_of(&self, parent_id: Uuid) -> SwarmlineResult<Vec<Uuid>> {
        Ok(self.get_task_status(parent_id)?.subtask_ids)
    }
}
