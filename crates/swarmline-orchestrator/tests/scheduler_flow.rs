//! End-to-end scheduler behaviour against in-process agent bodies.
//!
//! Covers priority dispatch, retry with backoff, cancellation, timeouts,
//! concurrency ceilings, subtask limits, instance recycling, eviction and
//! durable fallback.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarmline_core::{Payload, SwarmlineError};
use swarmline_orchestrator::*;
use swarmline_stream::{
    event_types, BufferedEvent, ExecutionStatus, FileExecutionStore, StreamItem,
};
use uuid::Uuid;

fn scheduler(config: SwarmConfig, agents: Vec<(AgentMetadata, Arc<dyn AgentBody>)>) -> SwarmScheduler {
    let registry = Arc::new(AgentRegistry::new());
    for (metadata, body) in agents {
        registry.register(metadata, body);
    }
    SwarmScheduler::new(config, registry).unwrap()
}

fn fast_retries() -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.scheduler.retry_backoff_base_ms = 50;
    config.scheduler.retry_backoff_max_ms = 1000;
    config
}

fn echo() -> Arc<dyn AgentBody> {
    body_fn(|req, _progress| async move { Ok(json!(req.description)) })
}

fn sleeper(duration: Duration) -> Arc<dyn AgentBody> {
    body_fn(move |_req, _progress| async move {
        tokio::time::sleep(duration).await;
        Ok(json!("slept"))
    })
}

fn always_failing() -> Arc<dyn AgentBody> {
    body_fn(|_req, _progress| async move {
        Err(SwarmlineError::ExecutionFailure("upstream unavailable".into()))
    })
}

async fn wait(scheduler: &SwarmScheduler, task_id: Uuid) -> SwarmTask {
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait_for_terminal(task_id))
        .await
        .expect("task did not reach a terminal state")
        .unwrap()
}

async fn wait_running(scheduler: &SwarmScheduler, task_id: Uuid) -> SwarmTask {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = scheduler.get_task_status(task_id).unwrap();
            if task.status == TaskStatus::Running {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started")
}

async fn recorded_events(scheduler: &SwarmScheduler, task_id: Uuid) -> Vec<BufferedEvent> {
    let mut stream = scheduler.subscribe_task(task_id, 0).unwrap();
    let mut events = Vec::new();
    while let Some(item) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream stalled")
    {
        if let StreamItem::Event(event) = item {
            events.push(event);
        }
    }
    events
}

fn types_of(events: &[BufferedEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Priority dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_runs_first_under_single_slot() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let order = Arc::clone(&order);
        body_fn(move |req, _progress| {
            let order = Arc::clone(&order);
            async move {
                order.lock().push(req.description.clone());
                Ok(json!(null))
            }
        })
    };
    let mut config = SwarmConfig::default();
    config.scheduler.max_concurrent_tasks = 1;
    let s = scheduler(config, vec![(AgentMetadata::new("worker"), recorder)]);

    let low = s
        .submit_task("background sweep", Payload::new(), Priority::BACKGROUND, Some("worker"))
        .unwrap();
    let normal = s
        .submit_task("normal report", Payload::new(), Priority::NORMAL, Some("worker"))
        .unwrap();
    let critical = s
        .submit_task("critical fix", Payload::new(), Priority::CRITICAL, Some("worker"))
        .unwrap();
    s.start();

    for id in [low, normal, critical] {
        assert_eq!(wait(&s, id).await.status, TaskStatus::Completed);
    }
    assert_eq!(
        *order.lock(),
        vec!["critical fix", "normal report", "background sweep"]
    );
    s.shutdown().await;
}

#[tokio::test]
async fn equal_priority_is_fifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let order = Arc::clone(&order);
        body_fn(move |req, _progress| {
            let order = Arc::clone(&order);
            async move {
                order.lock().push(req.description.clone());
                Ok(json!(null))
            }
        })
    };
    let mut config = SwarmConfig::default();
    config.scheduler.max_concurrent_tasks = 1;
    let s = scheduler(config, vec![(AgentMetadata::new("worker"), recorder)]);

    let ids: Vec<Uuid> = ["first", "second", "third"]
        .iter()
        .map(|d| s.submit_task(*d, Payload::new(), Priority::HIGH, Some("worker")).unwrap())
        .collect();
    s.start();
    for id in ids {
        wait(&s, id).await;
    }
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Retry with backoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_with_backoff_then_fail() {
    let mut config = SwarmConfig::default();
    config.scheduler.retry_backoff_base_ms = 200;
    config.scheduler.retry_backoff_max_ms = 10_000;
    let s = scheduler(config, vec![(AgentMetadata::new("flaky"), always_failing())]);
    s.start();

    let started = Instant::now();
    let id = s
        .submit_request(TaskRequest::new("fetch feed").with_agent("flaky").with_max_retries(2))
        .unwrap();
    let task = wait(&s, id).await;

    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.error.unwrap().contains("upstream unavailable"));

    let events = recorded_events(&s, id).await;
    assert_eq!(
        types_of(&events),
        vec![
            event_types::QUEUED,
            event_types::STARTED,
            event_types::RETRYING,
            event_types::STARTED,
            event_types::RETRYING,
            event_types::STARTED,
            event_types::FAILED,
        ]
    );
    let delays: Vec<u64> = events
        .iter()
        .filter(|e| e.event_type == event_types::RETRYING)
        .map(|e| e.payload["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays, vec![200, 400]);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64 + 1);
    }

    let metrics = s.get_metrics();
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.completed, 0);
    s.shutdown().await;
}

#[tokio::test]
async fn flaky_agent_succeeds_on_third_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let body = {
        let attempts = Arc::clone(&attempts);
        body_fn(move |req, _progress| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if req.context.attempt < 3 {
                    Err(SwarmlineError::ExecutionFailure("try again".into()))
                } else {
                    Ok(json!({ "attempt": req.context.attempt }))
                }
            }
        })
    };
    let s = scheduler(fast_retries(), vec![(AgentMetadata::new("flaky"), body)]);
    s.start();

    let id = s
        .submit_task("eventually", Payload::new(), Priority::NORMAL, Some("flaky"))
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.result, Some(json!({ "attempt": 3 })));
    assert!(task.error.is_none());
    assert!(task.execution_time_ms.is_some());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    s.shutdown().await;
}

#[tokio::test]
async fn invalid_input_is_not_retried() {
    let body = body_fn(|_req, _progress| async move {
        Err(SwarmlineError::InvalidInput("missing url".into()))
    });
    let s = scheduler(fast_retries(), vec![(AgentMetadata::new("strict"), body)]);
    s.start();

    let id = s
        .submit_task("crawl", Payload::new(), Priority::NORMAL, Some("strict"))
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_pending_task_never_runs() {
    let runs = Arc::new(AtomicU32::new(0));
    let body = {
        let runs = Arc::clone(&runs);
        body_fn(move |_req, _progress| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        })
    };
    let s = scheduler(SwarmConfig::default(), vec![(AgentMetadata::new("worker"), body)]);

    let id = s
        .submit_task("not needed", Payload::new(), Priority::NORMAL, Some("worker"))
        .unwrap();
    assert!(s.cancel_task(id).unwrap());
    s.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let task = s.get_task_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.started_at.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        types_of(&recorded_events(&s, id).await),
        vec![event_types::QUEUED, event_types::CANCELLED]
    );
    assert!(!s.cancel_task(id).unwrap());
    s.shutdown().await;
}

#[tokio::test]
async fn cancel_running_task_interrupts_body() {
    let s = scheduler(
        fast_retries(),
        vec![(AgentMetadata::new("slow"), sleeper(Duration::from_secs(30)))],
    );
    s.start();

    let id = s
        .submit_task("long crawl", Payload::new(), Priority::NORMAL, Some("slow"))
        .unwrap();
    let running = wait_running(&s, id).await;
    let instance_id = running.assigned_instance.unwrap();

    assert!(s.cancel_task(id).unwrap());
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retry_count, 0);
    assert!(task.started_at.is_some());
    assert!(!s.cancel_task(id).unwrap());

    let snapshot = s.get_execution(task.execution_id).await.unwrap();
    assert_eq!(snapshot.execution.status, ExecutionStatus::Cancelled);
    assert!(snapshot.execution.cancel_requested);

    // The instance neither succeeded nor failed.
    let instance = s
        .list_agent_instances(Some("slow"), None)
        .into_iter()
        .find(|i| i.id == instance_id)
        .unwrap();
    assert!(instance.current_tasks.is_empty());
    assert_eq!(instance.total_completed, 0);
    assert_eq!(instance.total_failed, 0);
    s.shutdown().await;
}

#[tokio::test]
async fn cancel_completed_task_is_not_cancellable() {
    let s = scheduler(SwarmConfig::default(), vec![(AgentMetadata::new("echo"), echo())]);
    s.start();

    let id = s
        .submit_task("summarise", Payload::new(), Priority::NORMAL, Some("echo"))
        .unwrap();
    let done = wait(&s, id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    assert!(!s.cancel_task(id).unwrap());

    let task = s.get_task_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("summarise")));
    assert!(!task.cancel_requested);

    let events = recorded_events(&s, id).await;
    assert_eq!(types_of(&events).last(), Some(&event_types::COMPLETED));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(!types_of(&events).contains(&event_types::CANCELLED));

    let snapshot = s.get_execution(task.execution_id).await.unwrap();
    assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
    assert!(!snapshot.execution.cancel_requested);
    assert_eq!(s.get_metrics().cancelled, 0);
    s.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_task_is_not_found() {
    let s = scheduler(SwarmConfig::default(), vec![]);
    assert!(matches!(
        s.cancel_task(Uuid::new_v4()),
        Err(SwarmlineError::NotFound { .. })
    ));
    assert!(matches!(
        s.get_task_status(Uuid::new_v4()),
        Err(SwarmlineError::NotFound { .. })
    ));
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execution_timeout_fails_task() {
    let mut config = fast_retries();
    config.scheduler.execution_timeout_secs = 1;
    let s = scheduler(
        config,
        vec![(AgentMetadata::new("slow"), sleeper(Duration::from_secs(30)))],
    );
    s.start();

    let id = s
        .submit_request(TaskRequest::new("hang").with_agent("slow").with_max_retries(0))
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timed out"));

    let instance = &s.list_agent_instances(Some("slow"), None)[0];
    assert_eq!(instance.total_failed, 1);
    assert_eq!(instance.error_count, 1);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Concurrency ceilings
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn gauged(total: &Arc<Gauge>, agent: &Arc<Gauge>) -> Arc<dyn AgentBody> {
    let (total, agent) = (Arc::clone(total), Arc::clone(agent));
    body_fn(move |_req, _progress| {
        let (total, agent) = (Arc::clone(&total), Arc::clone(&agent));
        async move {
            total.enter();
            agent.enter();
            tokio::time::sleep(Duration::from_millis(30)).await;
            agent.exit();
            total.exit();
            Ok(json!(null))
        }
    })
}

#[tokio::test]
async fn global_and_per_agent_caps_hold() {
    let total = Arc::new(Gauge::default());
    let alpha = Arc::new(Gauge::default());
    let beta = Arc::new(Gauge::default());

    let mut config = SwarmConfig::default();
    config.scheduler.max_concurrent_tasks = 3;
    config.scheduler.max_instances_per_agent = 2;
    let s = scheduler(
        config,
        vec![
            (AgentMetadata::new("alpha"), gauged(&total, &alpha)),
            (AgentMetadata::new("beta"), gauged(&total, &beta)),
        ],
    );
    s.start();

    let mut ids = Vec::new();
    for i in 0..16 {
        let agent = if i % 2 == 0 { "alpha" } else { "beta" };
        ids.push(
            s.submit_task(format!("job {i}"), Payload::new(), Priority::NORMAL, Some(agent))
                .unwrap(),
        );
    }
    for id in ids {
        assert_eq!(wait(&s, id).await.status, TaskStatus::Completed);
    }

    assert!(total.peak() <= 3, "global peak {}", total.peak());
    assert!(alpha.peak() <= 2, "alpha peak {}", alpha.peak());
    assert!(beta.peak() <= 2, "beta peak {}", beta.peak());
    assert!(s.list_agent_instances(Some("alpha"), None).len() <= 2);
    assert!(s.list_agent_instances(Some("beta"), None).len() <= 2);
    assert_eq!(s.get_metrics().completed, 16);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Agent selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_agent_fails_without_retry() {
    let s = scheduler(fast_retries(), vec![(AgentMetadata::new("echo"), echo())]);
    s.start();

    let id = s
        .submit_task("anything", Payload::new(), Priority::NORMAL, Some("ghost"))
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.error.unwrap().contains("Agent unavailable"));
    s.shutdown().await;
}

#[tokio::test]
async fn unassigned_task_goes_to_best_matching_agent() {
    let s = scheduler(
        SwarmConfig::default(),
        vec![
            (
                AgentMetadata::new("coder").with_capabilities(&["rust", "refactor"]),
                echo(),
            ),
            (
                AgentMetadata::new("writer").with_capabilities(&["summarize", "draft"]),
                echo(),
            ),
        ],
    );
    s.start();

    let id = s
        .submit_task("summarize the quarterly report", Payload::new(), Priority::NORMAL, None)
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_agent.as_deref(), Some("writer"));

    let unmatched = s
        .submit_task("bake sourdough", Payload::new(), Priority::NORMAL, None)
        .unwrap();
    assert_eq!(wait(&s, unmatched).await.status, TaskStatus::Failed);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Progress streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn body_progress_is_streamed_in_order() {
    let body = body_fn(|_req, progress| async move {
        progress.step("plan")?;
        progress.progress(swarmline_core::payload! { "pct" => 50 })?;
        progress.artifact("file://report.md")?;
        Ok::<_, SwarmlineError>(json!("done"))
    });
    let s = scheduler(SwarmConfig::default(), vec![(AgentMetadata::new("reporter"), body)]);
    s.start();

    let id = s
        .submit_task("report", Payload::new(), Priority::NORMAL, Some("reporter"))
        .unwrap();
    let mut live = s.subscribe_task(id, 0).unwrap();
    let mut seen = Vec::new();
    while let Some(item) = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .unwrap()
    {
        if let StreamItem::Event(event) = item {
            seen.push(event);
        }
    }
    assert_eq!(
        types_of(&seen),
        vec![
            event_types::QUEUED,
            event_types::STARTED,
            event_types::STEP,
            event_types::PROGRESS,
            event_types::ARTIFACT,
            event_types::COMPLETED,
        ]
    );
    assert_eq!(seen.last().unwrap().payload["result"], json!("done"));

    let task = s.get_task_status(id).unwrap();
    let snapshot = s.get_execution(task.execution_id).await.unwrap();
    assert_eq!(snapshot.execution.steps, vec!["plan".to_string()]);
    assert_eq!(snapshot.execution.artifacts, vec!["file://report.md".to_string()]);
    assert_eq!(snapshot.last_sequence, 6);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subtask_limits_are_enforced() {
    let mut config = SwarmConfig::default();
    config.scheduler.max_subtask_depth = 1;
    config.scheduler.max_subtasks_per_task = 2;
    let s = scheduler(config, vec![(AgentMetadata::new("echo"), echo())]);

    let parent = s
        .submit_request(TaskRequest::new("plan release").with_user("alice"))
        .unwrap();
    let first = s.submit_subtask(parent, TaskRequest::new("write notes")).unwrap();
    let second = s.submit_subtask(parent, TaskRequest::new("tag build")).unwrap();
    assert!(matches!(
        s.submit_subtask(parent, TaskRequest::new("one too many")),
        Err(SwarmlineError::InvalidInput(_))
    ));
    assert!(matches!(
        s.submit_subtask(first, TaskRequest::new("too deep")),
        Err(SwarmlineError::InvalidInput(_))
    ));
    assert!(matches!(
        s.submit_subtask(Uuid::new_v4(), TaskRequest::new("orphan")),
        Err(SwarmlineError::NotFound { .. })
    ));

    assert_eq!(s.subtasks_of(parent).unwrap(), vec![first, second]);
    let child = s.get_task_status(first).unwrap();
    assert_eq!(child.parent_id, Some(parent));
    assert_eq!(child.depth, 1);
    assert_eq!(child.user_id, "alice");

    assert!(s.cancel_task(second).unwrap());
    assert!(s.cancel_task(parent).unwrap());
    assert!(matches!(
        s.submit_subtask(parent, TaskRequest::new("late")),
        Err(SwarmlineError::AlreadyTerminal(_))
    ));
    // Cancelling the parent does not touch its children.
    assert_eq!(s.get_task_status(first).unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn body_can_spawn_and_await_subtasks() {
    let registry = Arc::new(AgentRegistry::new());
    let s = SwarmScheduler::new(SwarmConfig::default(), Arc::clone(&registry)).unwrap();
    registry.register(AgentMetadata::new("echo"), echo());
    let handle = s.clone();
    registry.register(
        AgentMetadata::new("planner"),
        body_fn(move |req, _progress| {
            let s = handle.clone();
            async move {
                let child = s.submit_subtask(
                    req.context.task_id,
                    TaskRequest::new("child step").with_agent("echo"),
                )?;
                let done = s.wait_for_terminal(child).await?;
                Ok::<_, SwarmlineError>(json!({ "child": done.result }))
            }
        }),
    );
    s.start();

    let id = s
        .submit_task("plan", Payload::new(), Priority::NORMAL, Some("planner"))
        .unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({ "child": "child step" })));
    assert_eq!(task.subtask_ids.len(), 1);
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_instance_is_recycled_and_replaced() {
    let mut config = SwarmConfig::default();
    config.health.idle_threshold_secs = 0;
    config.health.decay_factor = 0.5;
    let s = scheduler(config, vec![(AgentMetadata::new("echo"), echo())]);

    let original = s.spawn_instance("echo").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(s.run_health_check().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let recycled = s.run_health_check();
    assert_eq!(recycled.len(), 1);
    assert_eq!(recycled[0].instance_id, original);
    assert!(recycled[0].health_score < 0.3);
    let replacement = recycled[0].replacement.unwrap();

    let instances = s.list_agent_instances(Some("echo"), None);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, replacement);
    assert!((instances[0].health_score - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn terminated_instance_work_is_retried() {
    let body = body_fn(|req, _progress| async move {
        if req.context.attempt == 1 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(json!(req.context.attempt))
    });
    let s = scheduler(fast_retries(), vec![(AgentMetadata::new("worker"), body)]);
    s.start();

    let id = s
        .submit_task("resilient", Payload::new(), Priority::NORMAL, Some("worker"))
        .unwrap();
    let running = wait_running(&s, id).await;
    let instance_id = running.assigned_instance.unwrap();

    assert_eq!(s.terminate_instance(instance_id).unwrap(), vec![id]);
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.result, Some(json!(2)));
    assert_ne!(task.assigned_instance, Some(instance_id));
    assert!(s
        .list_agent_instances(None, None)
        .iter()
        .all(|i| i.id != instance_id));
    s.shutdown().await;
}

#[tokio::test]
async fn paused_instance_is_skipped() {
    let mut config = SwarmConfig::default();
    config.scheduler.max_instances_per_agent = 1;
    let s = scheduler(config, vec![(AgentMetadata::new("echo"), echo())]);
    let instance = s.spawn_instance("echo").unwrap();
    s.pause_instance(instance).unwrap();
    s.start();

    let id = s
        .submit_task("held", Payload::new(), Priority::NORMAL, Some("echo"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.get_task_status(id).unwrap().status, TaskStatus::Pending);

    s.resume_instance(instance).unwrap();
    let task = wait(&s, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_instance, Some(instance));
    s.shutdown().await;
}

// ---------------------------------------------------------------------------
// Dispatch control and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_dispatch_holds_queue() {
    let s = scheduler(SwarmConfig::default(), vec![(AgentMetadata::new("echo"), echo())]);
    s.start();
    s.pause_dispatch();

    let id = s
        .submit_task("wait for me", Payload::new(), Priority::NORMAL, Some("echo"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.get_task_status(id).unwrap().status, TaskStatus::Pending);
    assert_eq!(s.get_metrics().pending, 1);

    s.resume_dispatch();
    assert_eq!(wait(&s, id).await.status, TaskStatus::Completed);
    s.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_running_and_queued_work() {
    let mut config = SwarmConfig::default();
    config.scheduler.max_concurrent_tasks = 1;
    let s = scheduler(
        config,
        vec![(AgentMetadata::new("slow"), sleeper(Duration::from_secs(30)))],
    );
    s.start();

    let running = s
        .submit_task("first", Payload::new(), Priority::NORMAL, Some("slow"))
        .unwrap();
    let queued = s
        .submit_task("second", Payload::new(), Priority::NORMAL, Some("slow"))
        .unwrap();
    wait_running(&s, running).await;

    tokio::time::timeout(Duration::from_secs(5), s.shutdown())
        .await
        .expect("shutdown hung");
    for id in [running, queued] {
        let task = s.get_task_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.retry_count, 0);
    }
    assert!(matches!(
        s.submit_task("too late", Payload::new(), Priority::NORMAL, None),
        Err(SwarmlineError::InvalidInput(_))
    ));
}

// ---------------------------------------------------------------------------
// Cleanup and durable fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleanup_evicts_terminal_work() {
    let mut config = SwarmConfig::default();
    config.cleanup.retention_secs = 0;
    let s = scheduler(config, vec![(AgentMetadata::new("echo"), echo())]);
    s.start();

    let id = s
        .submit_task("short lived", Payload::new(), Priority::NORMAL, Some("echo"))
        .unwrap();
    let pending = s
        .submit_request(TaskRequest::new("parked").with_agent("ghost-agent-not-yet"))
        .unwrap();
    let task = wait(&s, id).await;
    wait(&s, pending).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = s.run_cleanup();
    assert_eq!(report.tasks_evicted, 2);
    assert_eq!(report.executions_evicted, 2);
    assert!(matches!(
        s.get_task_status(id),
        Err(SwarmlineError::AlreadyTerminal(_))
    ));
    assert!(matches!(
        s.cancel_task(id),
        Err(SwarmlineError::AlreadyTerminal(_))
    ));
    assert!(matches!(
        s.subscribe(task.execution_id, 0),
        Err(SwarmlineError::AlreadyTerminal(_))
    ));
    assert!(s.list_tasks(None).is_empty());
    assert_eq!(s.get_metrics().completed, 1);
    assert_eq!(s.run_cleanup(), SweepReport::default());
    s.shutdown().await;
}

#[tokio::test]
async fn evicted_execution_is_served_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileExecutionStore::new(dir.path().to_path_buf()).await.unwrap();
    let registry = Arc::new(AgentRegistry::new());
    registry.register(AgentMetadata::new("echo"), echo());
    let mut config = SwarmConfig::default();
    config.cleanup.retention_secs = 0;
    let s = SwarmScheduler::builder(config)
        .with_registry(registry)
        .with_store(Arc::new(store))
        .build()
        .unwrap();
    s.start();

    let id = s
        .submit_request(TaskRequest::new("persist me").with_agent("echo").with_user("alice"))
        .unwrap();
    let task = wait(&s, id).await;
    s.shutdown().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(s.run_cleanup().executions_evicted, 1);

    let snapshot = s.get_execution(task.execution_id).await.unwrap();
    assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.execution.result, Some(json!("persist me")));

    let listed = s.list_executions_by_user("alice", 10).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, task.execution_id);
    assert!(s.list_executions_by_user("bob", 10).await.is_empty());
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_track_outcomes() {
    let s = scheduler(
        fast_retries(),
        vec![
            (AgentMetadata::new("echo"), echo()),
            (AgentMetadata::new("broken"), always_failing()),
        ],
    );
    s.start();

    let ok = s
        .submit_task("fine", Payload::new(), Priority::NORMAL, Some("echo"))
        .unwrap();
    let bad = s
        .submit_request(TaskRequest::new("doomed").with_agent("broken").with_max_retries(1))
        .unwrap();
    wait(&s, ok).await;
    wait(&s, bad).await;

    let metrics = s.get_metrics();
    assert_eq!(metrics.submitted, 2);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.pending, 0);
    assert_eq!(metrics.agents_registered, 2);

    let json = metrics.to_json();
    assert_eq!(json["tasks"]["completed"], 1);
    assert_eq!(json["agents"]["registered"], 2);

    assert_eq!(s.list_tasks(Some(TaskStatus::Failed)).len(), 1);
    assert_eq!(s.list_tasks(None).len(), 2);
    s.shutdown().await;
}
