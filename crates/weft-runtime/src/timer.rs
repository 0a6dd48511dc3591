//! Timer min-heap.
//!
//! Deadline-ordered `BinaryHeap` with lazy cancellation: `cancel` marks the
//! id and the entry is skipped when it surfaces. Recurring timers re-insert
//! themselves on expiry. Ties break on id, so two timers with the same
//! deadline pop in creation order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// Shared so a recurring timer can fire many times.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    id: TimerId,
    callback: TimerCallback,
}

/// Reverses the ordering so the BinaryHeap max-heap yields the nearest
/// deadline first.
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.0.deadline, other.0.id).cmp(&(self.0.deadline, self.0.id))
    }
}

struct TimerInner {
    heap: BinaryHeap<HeapEntry>,
    /// Ids of entries still somewhere in the heap.
    pending: HashSet<TimerId>,
    /// Cancelled ids whose entries have not surfaced yet.
    cancelled: HashSet<TimerId>,
}

pub struct TimerQueue {
    inner: Mutex<TimerInner>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::new(),
                pending: HashSet::new(),
                cancelled: HashSet::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a timer firing after `delay` (then every `period` if given).
    /// The bool is true when the new timer became the nearest deadline, so
    /// a sleeping poller must be woken to re-bound its wait.
    pub fn add(
        &self,
        delay: Duration,
        callback: TimerCallback,
        period: Option<Duration>,
    ) -> (TimerId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock().unwrap();
        let was_front = inner
            .heap
            .peek()
            .map(|e| deadline < e.0.deadline)
            .unwrap_or(true);
        inner.pending.insert(id);
        inner.heap.push(HeapEntry(TimerEntry {
            deadline,
            period,
            id,
            callback,
        }));
        (id, was_front)
    }

    /// Cancel a pending timer. False when it already fired (or never
    /// existed).
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(&id) {
            inner.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Pop every timer due at `now`, skipping cancelled entries. Recurring
    /// timers are re-inserted with their next deadline.
    pub fn pop_expired(&self, now: Instant) -> Vec<TimerCallback> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        while let Some(head) = inner.heap.peek() {
            if head.0.deadline > now {
                break;
            }
            let entry = inner.heap.pop().map(|e| e.0);
            let Some(entry) = entry else { break };
            if inner.cancelled.remove(&entry.id) {
                continue;
            }
            fired.push(entry.callback.clone());
            match entry.period {
                Some(period) => {
                    inner.heap.push(HeapEntry(TimerEntry {
                        deadline: now + period,
                        ..entry
                    }));
                }
                None => {
                    inner.pending.remove(&entry.id);
                }
            }
        }
        if inner.heap.is_empty() {
            // Nothing left for stale cancel marks to match.
            inner.cancelled.clear();
        }
        fired
    }

    /// Nearest live deadline. Cancelled heads are dropped on the way.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        while let Some(head) = inner.heap.peek() {
            let id = head.0.id;
            if inner.cancelled.contains(&id) {
                inner.heap.pop();
                inner.cancelled.remove(&id);
                continue;
            }
            return Some(head.0.deadline);
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        TimerQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn pops_in_deadline_order() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let order = order.clone();
            q.add(
                Duration::from_millis(ms),
                Arc::new(move || order.lock().unwrap().push(tag)),
                None,
            );
        }
        let far = Instant::now() + Duration::from_secs(1);
        for cb in q.pop_expired(far) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn same_deadline_ties_break_by_id() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in [1, 2, 3] {
            let order = order.clone();
            q.add(
                Duration::from_millis(0),
                Arc::new(move || order.lock().unwrap().push(tag)),
                None,
            );
        }
        for cb in q.pop_expired(Instant::now() + Duration::from_millis(5)) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn not_due_not_popped() {
        let q = TimerQueue::new();
        q.add(Duration::from_secs(60), noop(), None);
        assert!(q.pop_expired(Instant::now()).is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_skips_entry() {
        let q = TimerQueue::new();
        let (id, _) = q.add(Duration::from_millis(1), noop(), None);
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
        assert!(!q.has_pending());
        let fired = q.pop_expired(Instant::now() + Duration::from_secs(1));
        assert!(fired.is_empty());
    }

    #[test]
    fn recurring_reinserts() {
        let q = TimerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let (id, _) = q.add(
            Duration::from_millis(10),
            Arc::new(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Duration::from_millis(10)),
        );
        for round in 1..=3u64 {
            let now = Instant::now() + Duration::from_millis(20 * round);
            for cb in q.pop_expired(now) {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(q.has_pending());
        assert!(q.cancel(id));
        assert!(q
            .pop_expired(Instant::now() + Duration::from_secs(10))
            .is_empty());
    }

    #[test]
    fn front_insert_reported() {
        let q = TimerQueue::new();
        let (_, front) = q.add(Duration::from_secs(10), noop(), None);
        assert!(front);
        let (_, front) = q.add(Duration::from_secs(20), noop(), None);
        assert!(!front);
        let (_, front) = q.add(Duration::from_secs(1), noop(), None);
        assert!(front);
    }

    #[test]
    fn next_deadline_skips_cancelled() {
        let q = TimerQueue::new();
        let (early, _) = q.add(Duration::from_millis(1), noop(), None);
        q.add(Duration::from_secs(5), noop(), None);
        q.cancel(early);
        let d = q.next_deadline().unwrap();
        assert!(d > Instant::now() + Duration::from_secs(1));
    }
}
