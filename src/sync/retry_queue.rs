//! Bounded retry queue: capped attempts per entry, capped length, oldest
//! evicted first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures an entry may accumulate, the initial one included.
    pub max_attempts: u32,
    pub capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueueEntry<T> {
    pub payload: T,
    pub attempts: u32,
    pub enqueued_at_epoch_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDisposition<T> {
    Requeued {
        attempts: u32,
        evicted: Option<RetryQueueEntry<T>>,
    },
    Dropped(RetryQueueEntry<T>),
}

#[derive(Debug, Clone)]
pub struct RetryQueue<T> {
    entries: VecDeque<RetryQueueEntry<T>>,
    policy: RetryPolicy,
}

impl<T> RetryQueue<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: VecDeque::with_capacity(policy.capacity),
            policy,
        }
    }

    /// Rebuilds a queue from persisted entries, discarding any already past
    /// the attempt bound and the oldest beyond capacity.
    pub fn from_entries(policy: RetryPolicy, entries: Vec<RetryQueueEntry<T>>) -> Self {
        let mut queue = Self::new(policy);
        let mut entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.attempts < policy.max_attempts)
            .collect();
        entries.sort_by_key(|entry| entry.enqueued_at_epoch_ms);
        let skip = entries.len().saturating_sub(policy.capacity);
        queue.entries.extend(entries.into_iter().skip(skip));
        queue
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetryQueueEntry<T>> {
        self.entries.iter()
    }

    /// Queues a payload whose first attempt just failed.
    ///
    /// Returns the entry that left the queue because of it: the oldest one
    /// when the queue was full, or the new one itself when the policy allows
    /// no retries at all.
    pub fn enqueue(&mut self, payload: T, now_ms: i64) -> Option<RetryQueueEntry<T>> {
        let entry = RetryQueueEntry {
            payload,
            attempts: 1,
            enqueued_at_epoch_ms: now_ms,
        };
        if entry.attempts >= self.policy.max_attempts || self.policy.capacity == 0 {
            return Some(entry);
        }
        self.insert(entry)
    }

    /// Removes every entry for a retry pass. Failures go back through
    /// `settle_failure`.
    pub fn take_all(&mut self) -> Vec<RetryQueueEntry<T>> {
        self.entries.drain(..).collect()
    }

    /// Counts a failed retry and either requeues the entry or drops it for
    /// good once it reaches the attempt bound.
    pub fn settle_failure(&mut self, mut entry: RetryQueueEntry<T>) -> RetryDisposition<T> {
        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts >= self.policy.max_attempts {
            return RetryDisposition::Dropped(entry);
        }
        let attempts = entry.attempts;
        let evicted = self.insert(entry);
        RetryDisposition::Requeued { attempts, evicted }
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    /// Keeps entries in enqueue order so eviction always hits the oldest.
    fn insert(&mut self, entry: RetryQueueEntry<T>) -> Option<RetryQueueEntry<T>> {
        let at = self
            .entries
            .iter()
            .position(|existing| existing.enqueued_at_epoch_ms > entry.enqueued_at_epoch_ms)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
        if self.entries.len() > self.policy.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }
}

impl<T: Clone> RetryQueue<T> {
    pub fn to_entries(&self) -> Vec<RetryQueueEntry<T>> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_evicts_the_oldest() {
        let mut queue = RetryQueue::new(RetryPolicy {
            max_attempts: 3,
            capacity: 3,
        });
        for n in 0..3 {
            assert!(queue.enqueue(n, n as i64).is_none());
        }
        let evicted = queue.enqueue(3, 3).expect("evicts");
        assert_eq!(evicted.payload, 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn entry_is_dropped_on_its_third_failure() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        queue.enqueue("push", 0);

        let entry = queue.take_all().remove(0);
        let RetryDisposition::Requeued { attempts, .. } = queue.settle_failure(entry) else {
            panic!("second failure should requeue");
        };
        assert_eq!(attempts, 2);

        let entry = queue.take_all().remove(0);
        assert!(matches!(queue.settle_failure(entry), RetryDisposition::Dropped(e) if e.attempts == 3));
        assert!(queue.is_empty());
    }

    #[test]
    fn requeued_entries_keep_their_age_order() {
        let mut queue = RetryQueue::new(RetryPolicy {
            max_attempts: 5,
            capacity: 2,
        });
        queue.enqueue("old", 10);
        let old = queue.take_all().remove(0);
        queue.enqueue("new", 20);

        let disposition = queue.settle_failure(old);
        assert!(matches!(disposition, RetryDisposition::Requeued { evicted: None, .. }));
        assert_eq!(queue.iter().map(|e| e.payload).collect::<Vec<_>>(), vec!["old", "new"]);

        let evicted = queue.enqueue("newest", 30).expect("evicts");
        assert_eq!(evicted.payload, "old");
    }

    #[test]
    fn restore_discards_exhausted_and_overflowing_entries() {
        let policy = RetryPolicy {
            max_attempts: 3,
            capacity: 2,
        };
        let entry = |payload, attempts, at| RetryQueueEntry {
            payload,
            attempts,
            enqueued_at_epoch_ms: at,
        };
        let queue = RetryQueue::from_entries(
            policy,
            vec![entry('c', 1, 30), entry('x', 3, 5), entry('a', 1, 10), entry('b', 2, 20)],
        );
        assert_eq!(queue.iter().map(|e| e.payload).collect::<Vec<_>>(), vec!['b', 'c']);
    }
}
