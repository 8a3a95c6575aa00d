use crate::scheduler::{Shared, SwarmScheduler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

/// What one cleanup pass removed from memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub tasks_evicted: usize,
    pub executions_evicted: usize,
}

impl Shared {
    /// Evict terminal executions and tasks older than the retention window.
    ///
    /// An execution with live subscribers is kept, and so is its task. Ids
    /// that were evicted answer `AlreadyTerminal` rather than `NotFound`.
    pub(crate) fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now
            .checked_sub_signed(self.config.cleanup.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut st = self.state.lock();
        let executions = self.hub.evict_expired(cutoff);

        let expired: Vec<Uuid> = st
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at.is_some_and(|at| at < cutoff)
                    && !self.hub.contains(t.execution_id)
            })
            .map(|t| t.id)
            .collect();
        for id in &expired {
            st.tasks.remove(id);
            st.evicted.insert(*id);
        }
        drop(st);

        let report = SweepReport {
            tasks_evicted: expired.len(),
            executions_evicted: executions.len(),
        };
        if report.tasks_evicted > 0 || report.executions_evicted > 0 {
            info!(
                tasks = report.tasks_evicted,
                executions = report.executions_evicted,
                "Evicted expired work"
            );
        }
        report
    }
}

pub(crate) async fn cleanup_loop(shared: Arc<Shared>) {
    let mut timer = tokio::time::interval(shared.config.cleanup.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = timer.tick() => {
                shared.sweep(Utc::now());
            }
        }
    }
    debug!("Cleanup sweeper stopped");
}

impl SwarmScheduler {
    /// Run one cleanup pass now.
    pub fn run_cleanup(&self) -> SweepReport {
        self.shared.sweep(Utc::now())
    }
}
