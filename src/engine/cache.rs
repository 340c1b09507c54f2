//! Seen-listing cache.
//!
//! Remembers which listing ids were already evaluated so the same item is
//! not valued (or bought) twice. Bounded: the oldest ids are evicted first
//! once `capacity` is reached.

use std::collections::{HashSet, VecDeque};

use crate::types::Listing;

#[derive(Debug)]
pub struct ScanCache {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
    evicted: u64,
}

impl ScanCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            evicted: 0,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Record an id. Returns `true` if it was not already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
                self.evicted += 1;
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    /// Forget an id so the next fetch evaluates it again.
    pub fn expire(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|entry| entry != id);
        true
    }

    /// Split a fetch into listings not seen before (now recorded) and the
    /// count of already-seen ones. Duplicates within one fetch count as seen.
    pub fn partition(&mut self, listings: Vec<Listing>) -> (Vec<Listing>, usize) {
        let mut fresh = Vec::new();
        let mut seen = 0;
        for listing in listings {
            if self.insert(&listing.id) {
                fresh.push(listing);
            } else {
                seen += 1;
            }
        }
        (fresh, seen)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
