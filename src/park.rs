//! Process-wide parking table: wait/notify over arbitrary 64-bit tokens.
//!
//! A lock-sharded hash table maps a token to a FIFO list of parked fibers.
//! The bucket array doubles in place under load: a single rehasher locks
//! every old bucket, marks them dead, drains them into a bigger array and
//! publishes it. Old arrays are retired through the QSBR epoch machinery
//! because readers may still hold the stale pointer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::fiber::{FiberContext, RunState};
use crate::qsbr;
use crate::scheduler;

const INITIAL_SHIFT: u32 = 6;

/// Thomas Wang's 64-bit mix. Spreads sequential tokens (addresses) across
/// the bucket mask.
pub(crate) fn mix_hash(mut key: u64) -> u64 {
    key = key.wrapping_add(!(key << 32));
    key ^= key >> 22;
    key = key.wrapping_add(!(key << 13));
    key ^= key >> 8;
    key = key.wrapping_add(key << 3);
    key ^= key >> 15;
    key = key.wrapping_add(!(key << 27));
    key ^= key >> 31;
    key
}

#[derive(Default)]
struct BucketInner {
    /// Set under the lock when this bucket's array has been superseded.
    /// Once set no waiter is ever inserted here; emplacers retry against
    /// the freshly published array.
    rehashed: bool,
    waiters: VecDeque<Arc<FiberContext>>,
}

#[derive(Default)]
struct Bucket {
    inner: Mutex<BucketInner>,
}

struct SizedBuckets {
    shift: u32,
    buckets: Vec<Bucket>,
}

impl SizedBuckets {
    fn new(shift: u32) -> SizedBuckets {
        let count = 1usize << shift;
        SizedBuckets {
            shift,
            buckets: (0..count).map(|_| Bucket::default()).collect(),
        }
    }

    fn index(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }
}

pub(crate) struct ParkingTable {
    buckets: AtomicPtr<SizedBuckets>,
    num_entries: AtomicUsize,
    rehashing: AtomicBool,
    rehash_count: AtomicU64,
    live_arrays: AtomicU64,
}

/// Counters for tests and diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct ParkStats {
    /// Parked fibers across all buckets.
    pub entries: usize,
    /// Buckets in the current array.
    pub buckets: usize,
    /// Completed rehashes since process start.
    pub rehashes: u64,
    /// Bucket arrays not yet reclaimed (1 when fully quiesced).
    pub live_arrays: u64,
}

lazy_static::lazy_static! {
    static ref TABLE: ParkingTable = ParkingTable::new();
}

pub(crate) fn table() -> &'static ParkingTable {
    &TABLE
}

/// Snapshot of the global table's counters. Must run on a registered
/// thread, like every other parking-table access.
pub fn park_stats() -> ParkStats {
    table().stats()
}

impl ParkingTable {
    fn new() -> ParkingTable {
        let sb = Box::into_raw(Box::new(SizedBuckets::new(INITIAL_SHIFT)));
        ParkingTable {
            buckets: AtomicPtr::new(sb),
            num_entries: AtomicUsize::new(0),
            rehashing: AtomicBool::new(false),
            rehash_count: AtomicU64::new(0),
            live_arrays: AtomicU64::new(1),
        }
    }

    fn stats(&self) -> ParkStats {
        // SAFETY: the current array is only retired after a grace period;
        // this thread has not passed a checkpoint since the load.
        let sb = unsafe { &*self.buckets.load(Ordering::Acquire) };
        ParkStats {
            entries: self.num_entries.load(Ordering::Relaxed),
            buckets: sb.buckets.len(),
            rehashes: self.rehash_count.load(Ordering::Relaxed),
            live_arrays: self.live_arrays.load(Ordering::Relaxed),
        }
    }

    /// Parks `fi` on `token` unless `validate` returns true under the bucket
    /// lock. The double check closes the race where the wakeup condition
    /// became true between the caller's first check and the lock.
    ///
    /// Returns whether the fiber was parked.
    pub(crate) fn emplace<V>(&self, token: u64, fi: &Arc<FiberContext>, mut validate: V) -> bool
    where
        V: FnMut() -> bool,
    {
        let hash = mix_hash(token);
        let mut inserted: Option<(*mut SizedBuckets, usize)> = None;

        loop {
            let sb_ptr = self.buckets.load(Ordering::Acquire);
            // SAFETY: arrays are retired through QSBR; the pointer stays
            // valid until this thread passes a quiescent point.
            let sb = unsafe { &*sb_ptr };
            let bucket = &sb.buckets[sb.index(hash)];
            let mut guard = bucket.inner.lock();
            if guard.rehashed {
                // The table grew under us; the next load observes the new
                // array.
                continue;
            }

            if validate() {
                break;
            }

            fi.set_park_token(token);
            fi.set_run_state(RunState::Parked);
            guard.waiters.push_back(fi.clone());
            let prev = self.num_entries.fetch_add(1, Ordering::Relaxed);
            inserted = Some((sb_ptr, prev));
            break;
        }

        match inserted {
            Some((snapshot, prev_entries)) => {
                // SAFETY: same array the waiter was inserted into; not yet
                // retired because this thread has not checkpointed since.
                let num_buckets = unsafe { (*snapshot).buckets.len() };
                if prev_entries > num_buckets {
                    self.try_rehash(snapshot);
                }
                true
            }
            None => {
                // The caller is not going to park, so this is an operation
                // boundary and a quiescent point.
                qsbr::checkpoint();
                false
            }
        }
    }

    /// Removes the first fiber parked on `token`. `on_hit` runs under the
    /// bucket lock with the removed fiber, `on_miss` under the lock when no
    /// match exists (used to clear the parking flag of a not-yet-parked
    /// target).
    pub(crate) fn remove<H, M>(
        &self,
        token: u64,
        on_hit: H,
        on_miss: M,
    ) -> Option<Arc<FiberContext>>
    where
        H: FnOnce(&Arc<FiberContext>),
        M: FnOnce(),
    {
        let hash = mix_hash(token);
        loop {
            let sb_ptr = self.buckets.load(Ordering::Acquire);
            // SAFETY: see `emplace`.
            let sb = unsafe { &*sb_ptr };
            let bucket = &sb.buckets[sb.index(hash)];
            let mut guard = bucket.inner.lock();
            if guard.rehashed {
                continue;
            }

            let found = guard
                .waiters
                .iter()
                .position(|fi| fi.park_token() == token);
            let removed = match found {
                Some(i) => {
                    let fi = guard.waiters.remove(i).expect("indexed waiter");
                    let prev = self.num_entries.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(prev > 0);
                    on_hit(&fi);
                    Some(fi)
                }
                None => {
                    on_miss();
                    None
                }
            };
            drop(guard);
            qsbr::checkpoint();
            return removed;
        }
    }

    /// Moves every fiber parked on `token` onto `out`, preserving parking
    /// order.
    pub(crate) fn remove_all(&self, token: u64, out: &mut VecDeque<Arc<FiberContext>>) {
        let hash = mix_hash(token);
        loop {
            let sb_ptr = self.buckets.load(Ordering::Acquire);
            // SAFETY: see `emplace`.
            let sb = unsafe { &*sb_ptr };
            let bucket = &sb.buckets[sb.index(hash)];
            let mut guard = bucket.inner.lock();
            if guard.rehashed {
                continue;
            }

            let mut kept = VecDeque::with_capacity(guard.waiters.len());
            while let Some(fi) = guard.waiters.pop_front() {
                if fi.park_token() == token {
                    let prev = self.num_entries.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(prev > 0);
                    out.push_back(fi);
                } else {
                    kept.push_back(fi);
                }
            }
            guard.waiters = kept;
            drop(guard);
            qsbr::checkpoint();
            return;
        }
    }

    /// Doubles the bucket array. Single-writer; losers and stale snapshots
    /// back off. The old array is retired, not freed: readers that loaded it
    /// before the swap finish against locked, `rehashed`-marked buckets and
    /// retry, and the memory goes away once every thread has quiesced.
    fn try_rehash(&self, snapshot: *mut SizedBuckets) {
        if self.rehashing.swap(true, Ordering::Acquire) {
            return;
        }
        let cur = self.buckets.load(Ordering::Relaxed);
        if cur != snapshot {
            self.rehashing.store(false, Ordering::Release);
            return;
        }

        // SAFETY: `cur` is the published array and cannot be retired while
        // we hold the rehashing flag.
        let old = unsafe { &*cur };
        let new_sb = Box::new(SizedBuckets::new(old.shift + 1));
        self.live_arrays.fetch_add(1, Ordering::Relaxed);

        let mut guards: Vec<_> = old.buckets.iter().map(|b| b.inner.lock()).collect();
        for guard in guards.iter_mut() {
            guard.rehashed = true;
            while let Some(fi) = guard.waiters.pop_front() {
                let hash = mix_hash(fi.park_token());
                let target = &new_sb.buckets[new_sb.index(hash)];
                // The new array is not published yet, the lock is free.
                target.inner.lock().waiters.push_back(fi);
            }
        }

        let new_ptr = Box::into_raw(new_sb);
        self.buckets.store(new_ptr, Ordering::Release);
        drop(guards);

        let epoch = qsbr::advance_epoch();
        let retired = cur as usize;
        let table_addr = self as *const ParkingTable as usize;
        let reclaim = Box::new(move || {
            // SAFETY: the grace period for `epoch` has elapsed, no thread
            // can still hold the retired pointer; the table itself outlives
            // all schedulers and with them every deferred callback.
            unsafe {
                drop(Box::from_raw(retired as *mut SizedBuckets));
                (*(table_addr as *const ParkingTable))
                    .live_arrays
                    .fetch_sub(1, Ordering::Relaxed);
            }
        });
        if scheduler::try_with_scheduler(|sched| sched.defer(epoch, reclaim)).is_none() {
            // Rehash from a thread without a scheduler only happens in
            // detached test setups; keep the old array alive forever rather
            // than free it under concurrent readers.
            debug!(target: "spindle.park", "no scheduler to defer reclamation, old array kept");
        }

        self.rehash_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "spindle.park",
            from = old.buckets.len(),
            to = 1usize << (old.shift + 1),
            "parking table rehashed"
        );
        self.rehashing.store(false, Ordering::Release);
    }
}
