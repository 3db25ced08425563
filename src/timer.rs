use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Callback run once when a timer expires.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// A pending expiry.
pub struct TimerNode<K> {
    pub id: K,
    pub expires: Instant,
    callback: TimeoutCallback,
}

/// Binary min-heap of timers keyed by expiry, with an id -> slot map so any
/// timer can be adjusted or removed in O(log n).
///
/// Only the event loop thread owns a `TimerHeap`; it is not synchronized.
pub struct TimerHeap<K> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> TimerHeap<K> {
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

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Expiry of the timer registered under `id`.
    pub fn expiry(&self, id: K) -> Option<Instant> {
        self.index.get(&id).map(|&i| self.heap[i].expires)
    }

    /// Register a timer `delay` from now. An existing timer with the same id
    /// is replaced, so there is never more than one live node per id.
    pub fn add(&mut self, id: K, delay: Duration, callback: TimeoutCallback) {
        self.add_at(id, Instant::now() + delay, callback);
    }

    pub fn add_at(&mut self, id: K, expires: Instant, callback: TimeoutCallback) {
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].callback = callback;
            self.reschedule(i, expires);
            return;
        }

        self.heap.push(TimerNode {
            id,
            expires,
            callback,
        });
        let i = self.heap.len() - 1;
        self.index.insert(id, i);
        self.sift_up(i);
    }

    /// Push the expiry of `id` to `delay` from now. Unknown ids are ignored:
    /// the connection may already be gone.
    pub fn adjust(&mut self, id: K, delay: Duration) {
        self.adjust_at(id, Instant::now() + delay);
    }

    pub fn adjust_at(&mut self, id: K, expires: Instant) {
        if let Some(&i) = self.index.get(&id) {
            self.reschedule(i, expires);
        }
    }

    /// Drop the timer for `id` without running it. Unknown ids are ignored.
    pub fn remove(&mut self, id: K) -> bool {
        match self.index.get(&id) {
            Some(&i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    /// Run every timer whose expiry is at or before `now`. Each node leaves
    /// the heap before its callback runs, so a callback fires at most once
    /// and never sees a half-updated heap. Returns how many fired.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.callback)();
            fired += 1;
        }
        fired
    }

    /// Time until the next expiry, or `None` when nothing is pending.
    pub fn next_wake(&self, now: Instant) -> Option<Duration> {
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    /// `next_wake` as an epoll timeout: -1 blocks forever, otherwise the
    /// delay in milliseconds rounded up so we never wake early.
    pub fn next_wake_ms(&self, now: Instant) -> i32 {
        match self.next_wake(now) {
            None => -1,
            Some(delay) => {
                let ms = delay.as_millis() + u128::from(delay.subsec_nanos() % 1_000_000 != 0);
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn reschedule(&mut self, i: usize, expires: Instant) {
        let earlier = expires < self.heap[i].expires;
        self.heap[i].expires = expires;
        if earlier {
            self.sift_up(i);
        } else {
            self.sift_down(i);
        }
    }

    fn remove_at(&mut self, i: usize) -> TimerNode<K> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);

        if i < self.heap.len() {
            self.index.insert(self.heap[i].id, i);
            if !self.sift_down(i) {
                self.sift_up(i);
            }
        }
        node
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.heap[left + 1].expires < self.heap[left].expires {
                child = left + 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    /// Checks the heap order and the index map. Used by tests.
    #[doc(hidden)]
    pub fn is_consistent(&self) -> bool {
        let ordered = (1..self.heap.len())
            .all(|i| self.heap[(i - 1) / 2].expires <= self.heap[i].expires);
        let indexed = self.index.len() == self.heap.len()
            && self
                .heap
                .iter()
                .enumerate()
                .all(|(i, node)| self.index.get(&node.id) == Some(&i));
        ordered && indexed
    }
}

impl<K: Copy + Eq + Hash> Default for TimerHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}
