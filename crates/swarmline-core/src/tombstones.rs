use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Bounded memory of ids that were evicted after reaching a terminal state.
///
/// Lets lookups on evicted entities answer "already terminal" instead of
/// "not found". The oldest ids are forgotten first once `limit` is reached.
#[derive(Debug, Clone)]
pub struct Tombstones {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    limit: usize,
}

impl Tombstones {
    pub fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn insert(&mut self, id: Uuid) {
        if self.ids.insert(id) {
            self.order.push_back(id);
        }
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for Tombstones {
    fn default() -> Self {
        Self::new(4096)
    }
}
