//! Deadline-ordered index of sleeping fibers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::fiber::FiberContext;

/// Key of a sleeping fiber. Ordered by deadline; the insertion sequence
/// breaks ties so that equal deadlines wake in insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SleepKey {
    deadline: Instant,
    seq: u64,
}

#[derive(Default)]
pub(crate) struct SleepIndex {
    entries: BTreeMap<SleepKey, Arc<FiberContext>>,
    next_seq: u64,
}

impl SleepIndex {
    pub(crate) fn insert(&mut self, deadline: Instant, fi: Arc<FiberContext>) -> SleepKey {
        let key = SleepKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, fi);
        key
    }

    /// Early wake: drops the entry for a fiber that is being made ready
    /// before its deadline.
    pub(crate) fn remove(&mut self, key: SleepKey) -> Option<Arc<FiberContext>> {
        self.entries.remove(&key)
    }

    /// Pops the earliest entry whose deadline has passed.
    pub(crate) fn pop_ripe(&mut self, now: Instant) -> Option<Arc<FiberContext>> {
        let key = *self.entries.keys().next()?;
        if key.deadline > now {
            return None;
        }
        self.entries.remove(&key)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|k| k.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{FiberContext, FiberKind};
    use std::time::Duration;

    fn ctx(name: &str) -> Arc<FiberContext> {
        FiberContext::bare(FiberKind::Worker, name.to_string())
    }

    #[test]
    fn wakes_in_deadline_order() {
        let mut index = SleepIndex::default();
        let base = Instant::now();
        index.insert(base + Duration::from_millis(30), ctx("late"));
        index.insert(base + Duration::from_millis(10), ctx("early"));
        index.insert(base + Duration::from_millis(20), ctx("mid"));

        let now = base + Duration::from_millis(40);
        let order: Vec<_> = std::iter::from_fn(|| index.pop_ripe(now))
            .map(|fi| fi.name().to_string())
            .collect();
        assert_eq!(order, ["early", "mid", "late"]);
        assert!(index.is_empty());
    }

    #[test]
    fn equal_deadlines_wake_in_insertion_order() {
        let mut index = SleepIndex::default();
        let deadline = Instant::now();
        index.insert(deadline, ctx("first"));
        index.insert(deadline, ctx("second"));

        assert_eq!(index.pop_ripe(deadline).unwrap().name(), "first");
        assert_eq!(index.pop_ripe(deadline).unwrap().name(), "second");
    }

    #[test]
    fn unripe_entries_stay_put() {
        let mut index = SleepIndex::default();
        let base = Instant::now();
        let deadline = base + Duration::from_secs(60);
        let key = index.insert(deadline, ctx("far"));
        assert!(index.pop_ripe(base).is_none());
        assert_eq!(index.next_deadline(), Some(deadline));

        assert!(index.remove(key).is_some());
        assert!(index.is_empty());
    }
}
