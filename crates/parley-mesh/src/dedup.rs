//! Consumer-side duplicate suppression for at-least-once delivery

use std::collections::{HashSet, VecDeque};

use parley_core::DedupKey;

/// Bounded window of recently seen delivery keys.
///
/// Once full, the oldest key is forgotten. Redeliveries older than the
/// window are not detected.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key`; returns `false` if it was already seen
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
