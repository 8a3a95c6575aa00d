use crate::pool::Recycled;
use crate::scheduler::{Shared, SwarmScheduler};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

impl Shared {
    /// Score every instance and recycle the ones below the floor: their
    /// running tasks are interrupted (and retried by the normal policy) and
    /// a fresh instance takes their place.
    pub(crate) fn health_check(&self, now: DateTime<Utc>) -> Vec<Recycled> {
        let mut st = self.state.lock();
        let mut recycled = st.pool.health_tick(now, &self.config.health);
        for r in &mut recycled {
            self.interrupt(&st, &r.in_flight);
            if let Some(metadata) = self.registry.metadata(&r.agent_name) {
                if st.pool.can_spawn(&r.agent_name) {
                    match st.pool.spawn(&metadata) {
                        Ok(id) => r.replacement = Some(id),
                        Err(e) => {
                            warn!(agent = %r.agent_name, error = %e, "Replacement spawn failed");
                        }
                    }
                }
            }
            info!(
                instance_id = %r.instance_id,
                agent = %r.agent_name,
                health_score = r.health_score,
                interrupted = r.in_flight.len(),
                replacement = ?r.replacement,
                "Instance recycled"
            );
        }
        let instances = st.pool.len();
        drop(st);

        debug!(instances, recycled = recycled.len(), "Health check complete");
        if !recycled.is_empty() {
            self.wakeup.notify_one();
        }
        recycled
    }
}

pub(crate) async fn health_loop(shared: Arc<Shared>) {
    let mut timer = tokio::time::interval(shared.config.health.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    timer.tick().await;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = timer.tick() => {
                shared.health_check(Utc::now());
            }
        }
    }
    debug!("Health monitor stopped");
}

impl SwarmScheduler {
    /// Run one health-monitor pass now and return the recycled instances.
    pub fn run_health_check(&self) -> Vec<Recycled> {
        self.shared.health_check(Utc::now())
    }
}
