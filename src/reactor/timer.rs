//! A minimal timer wheel: a deadline-ordered min-heap of one-shot
//! callbacks. Removal is lazy — a removed entry's callback is dropped
//! immediately but its heap slot is only reclaimed when it would otherwise
//! fire, at which point it's found missing from `callbacks` and skipped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::Reactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct Entry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest deadline first.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    callbacks: HashMap<u64, Box<dyn FnOnce(&mut Reactor)>>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, deadline: Instant, callback: Box<dyn FnOnce(&mut Reactor)>) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.insert(id, callback);
        self.heap.push(Entry { deadline, id });
        TimerHandle(id)
    }

    pub fn remove(&mut self, handle: TimerHandle) {
        self.callbacks.remove(&handle.0);
    }

    /// Fires (and removes) every timer whose deadline is `<= now`.
    pub fn fire_due(&mut self, now: Instant, reactor: &mut Reactor) {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if let Some(callback) = self.callbacks.remove(&entry.id) {
                callback(reactor);
            }
        }
    }

    /// The deadline of the earliest still-live timer, skipping any that
    /// were removed but whose heap slot hasn't been reclaimed yet.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|entry| self.callbacks.contains_key(&entry.id))
            .map(|entry| entry.deadline)
            .min()
    }
}
