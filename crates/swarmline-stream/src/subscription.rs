use crate::hub::ExecutionHub;
use crate::types::StreamItem;
use chrono::Utc;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use swarmline_core::SwarmlineResult;
use uuid::Uuid;

/// A subscriber's view of one execution (or of all executions).
pub type EventStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// Detaches the subscriber when the stream is dropped.
struct SubscriptionGuard {
    hub: Arc<ExecutionHub>,
    execution_id: Option<Uuid>,
    subscriber_id: Option<u64>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscriber_id) = self.subscriber_id {
            self.hub.detach(self.execution_id, subscriber_id);
        }
    }
}

impl ExecutionHub {
    /// Subscribe to an execution, resuming after `from_sequence`.
    ///
    /// The stream first replays retained events with a higher sequence, then
    /// follows live events, yielding a keepalive after each idle interval.
    /// It ends right after the terminal event. Resubscribing with the last
    /// sequence seen resumes without duplicates; history that was trimmed
    /// from the buffer is announced with [`StreamItem::Gap`]. A
    /// `from_sequence` past the last emitted event is rejected with
    /// [`SwarmlineError::InvalidInput`](swarmline_core::SwarmlineError).
    pub fn subscribe(
        self: &Arc<Self>,
        execution_id: Uuid,
        from_sequence: u64,
    ) -> SwarmlineResult<EventStream> {
        let (replay, live) = self.attach(execution_id, from_sequence)?;
        let (subscriber_id, rx) = match live {
            Some((id, rx)) => (Some(id), Some(rx)),
            None => (None, None),
        };
        let guard = SubscriptionGuard {
            hub: Arc::clone(self),
            execution_id: Some(execution_id),
            subscriber_id,
        };
        let hub = Arc::clone(self);
        let keepalive = self.config().keepalive();

        let stream = async_stream::stream! {
            let _guard = guard;
            let mut last = from_sequence;

            if let Some((requested_from, first_available)) = replay.gap {
                yield StreamItem::Gap { requested_from, first_available };
            }
            for event in replay.events {
                last = event.sequence;
                let terminal = event.is_terminal();
                yield StreamItem::Event(event);
                if terminal {
                    return;
                }
            }

            let Some(mut rx) = rx else {
                return;
            };
            loop {
                let event = match tokio::time::timeout(keepalive, rx.recv()).await {
                    Err(_) => {
                        // Idle, or everything since `last` was dropped for us.
                        let Some(missed) = hub.backfill(execution_id, last, u64::MAX) else {
                            return;
                        };
                        if missed.events.is_empty() && missed.gap.is_none() {
                            yield StreamItem::Keepalive { timestamp: Utc::now() };
                            continue;
                        }
                        if let Some((requested_from, first_available)) = missed.gap {
                            yield StreamItem::Gap { requested_from, first_available };
                        }
                        for event in missed.events {
                            last = event.sequence;
                            let terminal = event.is_terminal();
                            yield StreamItem::Event(event);
                            if terminal {
                                return;
                            }
                        }
                        continue;
                    }
                    Ok(None) => return,
                    Ok(Some(event)) => event,
                };
                if event.sequence <= last {
                    continue;
                }
                if event.sequence > last + 1 {
                    // Our queue overflowed; recover what the buffer still has.
                    let Some(missed) = hub.backfill(execution_id, last, event.sequence) else {
                        return;
                    };
                    if let Some((requested_from, first_available)) = missed.gap {
                        yield StreamItem::Gap { requested_from, first_available };
                    }
                    for event in missed.events {
                        last = event.sequence;
                        yield StreamItem::Event(event);
                    }
                }
                last = event.sequence;
                let terminal = event.is_terminal();
                yield StreamItem::Event(event);
                if terminal {
                    return;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Follow every execution's events while none of them has a dedicated
    /// subscriber. Requires `global_fallback`; never replays and never ends
    /// on its own.
    pub fn subscribe_global(self: &Arc<Self>) -> EventStream {
        let (subscriber_id, mut rx) = self.attach_global();
        let guard = SubscriptionGuard {
            hub: Arc::clone(self),
            execution_id: None,
            subscriber_id: Some(subscriber_id),
        };
        let keepalive = self.config().keepalive();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                match tokio::time::timeout(keepalive, rx.recv()).await {
                    Err(_) => yield StreamItem::Keepalive { timestamp: Utc::now() },
                    Ok(None) => return,
                    Ok(Some(event)) => yield StreamItem::Event(event),
                }
            }
        };
        Box::pin(stream)
    }
}
