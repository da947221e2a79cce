//! Binary min-heap of per-connection idle deadlines.
//!
//! Nodes are keyed by expiry time; a side index maps connection id to
//! heap slot so any node can be adjusted or removed in O(log n) without
//! scanning. Ids are weak references: the heap never owns a connection,
//! callers resolve ids through their own table and ignore stale ones.
//!
//! # Complexity
//!
//! - `add` / `adjust` / `remove`: O(log n)
//! - `pop_expired`: O(k log n) for k expirations
//! - `next_deadline`: O(1)

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct TimerNode {
    id: u64,
    expires: Instant,
}

/// Min-heap with an id → slot index. Single-threaded: only the reactor
/// thread touches timers.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert a deadline for `id`, or refresh it if `id` is already
    /// tracked. An id never produces two nodes.
    pub fn add(&mut self, id: u64, timeout: Duration) {
        let expires = Instant::now() + timeout;
        match self.index.get(&id) {
            None => {
                let slot = self.heap.len();
                self.index.insert(id, slot);
                self.heap.push(TimerNode { id, expires });
                self.sift_up(slot);
            }
            Some(&slot) => {
                self.heap[slot].expires = expires;
                if !self.sift_down(slot, self.heap.len()) {
                    self.sift_up(slot);
                }
            }
        }
    }

    /// Refresh the deadline of a tracked id. Callers must check
    /// membership first when presence is not guaranteed.
    pub fn adjust(&mut self, id: u64, timeout: Duration) {
        assert!(self.contains(id), "adjust on untracked timer id");
        let slot = self.index[&id];
        self.heap[slot].expires = Instant::now() + timeout;
        if !self.sift_down(slot, self.heap.len()) {
            self.sift_up(slot);
        }
    }

    /// Drop the node for `id`. No-op if the id is not tracked.
    pub fn remove(&mut self, id: u64) {
        if let Some(&slot) = self.index.get(&id) {
            self.delete_at(slot);
        }
    }

    /// Pop every node whose deadline is at or before `now`, invoking
    /// `on_expire` with its id, in deadline order. Stops at the first
    /// live root.
    pub fn pop_expired<F: FnMut(u64)>(&mut self, now: Instant, mut on_expire: F) {
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let id = root.id;
            self.delete_at(0);
            on_expire(id);
        }
    }

    /// Time until the earliest deadline, zero if already overdue, `None`
    /// if no timers are armed.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(now))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Swap-to-end removal: move slot `i` behind the live region, pop,
    /// then re-sift whatever landed in `i`.
    fn delete_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
            if !self.sift_down(i, last) {
                self.sift_up(i);
            }
        }
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires < self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node actually moved down.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires < self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
