use crate::types::BufferedEvent;
use chrono::Utc;
use std::collections::VecDeque;
use swarmline_core::Payload;
use uuid::Uuid;

/// Result of asking a buffer for everything after a sequence number.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    /// Retained events with `sequence > from`, in order.
    pub events: Vec<BufferedEvent>,
    /// Set when events between `from` and the first retained sequence were
    /// trimmed: `(requested_from, first_available)`.
    pub gap: Option<(u64, u64)>,
}

/// Bounded per-execution event log.
///
/// Sequence numbers start at 1 and are gap-free from the first retained
/// event. Once `max_size` is exceeded the oldest events are dropped.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    execution_id: Uuid,
    events: VecDeque<BufferedEvent>,
    next_sequence: u64,
    max_size: usize,
}

impl EventBuffer {
    pub fn new(execution_id: Uuid, max_size: usize) -> Self {
        Self {
            execution_id,
            events: VecDeque::new(),
            next_sequence: 1,
            max_size: max_size.max(1),
        }
    }

    /// Append an event with the next sequence number and trim to size.
    pub fn push(&mut self, event_type: impl Into<String>, payload: Payload) -> BufferedEvent {
        let event = BufferedEvent {
            execution_id: self.execution_id,
            sequence: self.next_sequence,
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        };
        self.next_sequence += 1;
        self.events.push_back(event.clone());
        while self.events.len() > self.max_size {
            self.events.pop_front();
        }
        event
    }

    /// Sequence of the most recent event, or 0 if nothing was emitted yet.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Sequence of the oldest retained event.
    pub fn first_retained(&self) -> Option<u64> {
        self.events.front().map(|e| e.sequence)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Everything retained after `from`, flagging trimmed history.
    pub fn replay_after(&self, from: u64) -> Replay {
        let Some(first) = self.first_retained() else {
            return Replay::default();
        };
        let gap = (from.saturating_add(1) < first).then_some((from, first));
        let skip = from.saturating_add(1).saturating_sub(first) as usize;
        Replay {
            events: self.events.iter().skip(skip).cloned().collect(),
            gap,
        }
    }

    /// Retained events strictly between `after` and `before`.
    pub fn range(&self, after: u64, before: u64) -> Replay {
        let mut replay = self.replay_after(after);
        replay.events.retain(|e| e.sequence < before);
        if let Some((_, first)) = replay.gap {
            if first >= before {
                replay.gap = Some((after, before));
            }
        }
        replay
    }
}
