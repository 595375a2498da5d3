//! Bounded, insertion-ordered set of recently seen request ids

use std::collections::{HashSet, VecDeque};

/// Default number of remembered request ids
pub const DEDUP_CAPACITY: usize = 100;

/// Remembers the newest `capacity` request ids. When full, the oldest entry
/// is evicted first.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    members: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            members: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Insert `request_id` unless already present.
    ///
    /// Returns `false` for a duplicate. Membership test and insertion happen
    /// in one call so the caller can hold a single lock around it.
    pub fn insert(&mut self, request_id: &str) -> bool {
        if self.members.contains(request_id) {
            return false;
        }

        self.members.insert(request_id.to_string());
        self.order.push_back(request_id.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.members.contains(request_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY)
    }
}
