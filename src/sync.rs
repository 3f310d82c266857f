//! Fiber-blocking synchronization primitives.
//!
//! All of these are thin layers over token parking: the wait object's
//! address is the token, `suspend_conditionally` double-checks the wait
//! condition under the parking-table lock, and the notifying side flips the
//! condition before it wakes anyone, so there is no window for a missed
//! wakeup.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::fiber::{self, FiberContext};

/// Epoch-style notification counter.
///
/// Waiters snapshot the sequence with [`prepare_wait`](EventCount::prepare_wait),
/// re-check their condition, and park with [`wait`](EventCount::wait); any
/// notification in between bumps the sequence and the park is skipped.
pub struct EventCount {
    seq: AtomicU64,
}

impl EventCount {
    pub const fn new() -> EventCount {
        EventCount {
            seq: AtomicU64::new(0),
        }
    }

    fn token(&self) -> u64 {
        self as *const EventCount as u64
    }

    pub fn prepare_wait(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Parks until the sequence moves past `ticket`.
    pub fn wait(&self, ticket: u64) {
        let me = fiber::current();
        me.suspend_conditionally(self.token(), || {
            self.seq.load(Ordering::Acquire) != ticket
        });
    }

    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        FiberContext::notify_token_one(self.token());
    }

    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        FiberContext::notify_token_all(self.token());
    }

    /// Parks until `cond` holds, rechecking across wakeups.
    pub fn await_until(&self, mut cond: impl FnMut() -> bool) {
        while !cond() {
            let ticket = self.prepare_wait();
            if cond() {
                break;
            }
            self.wait(ticket);
        }
    }
}

impl Default for EventCount {
    fn default() -> EventCount {
        EventCount::new()
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Mutual exclusion that blocks fibers, not threads.
pub struct Mutex<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes access to `data` exactly like a standard
// mutex; the guard is the only way in.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    fn token(&self) -> u64 {
        self as *const Mutex<T> as u64
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = fiber::current();
        loop {
            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            me.suspend_conditionally(self.token(), || {
                self.state.load(Ordering::Relaxed) == UNLOCKED
            });
        }
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.state.store(UNLOCKED, Ordering::Release);
        FiberContext::notify_token_one(self.mutex.token());
    }
}

/// Condition variable for [`Mutex`].
pub struct Condvar {
    ec: EventCount,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            ec: EventCount::new(),
        }
    }

    /// Atomically snapshots the notification sequence, releases the lock and
    /// parks; re-acquires the lock before returning. Wakeups may be
    /// spurious, callers loop on their predicate.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        let ticket = self.ec.prepare_wait();
        drop(guard);
        self.ec.wait(ticket);
        mutex.lock()
    }

    pub fn notify_one(&self) {
        self.ec.notify_one();
    }

    pub fn notify_all(&self) {
        self.ec.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn mutex_serializes_fibers() {
        let _fb = runtime::init();
        let shared = Arc::new(Mutex::new(0u64));
        let mut handles = Vec::new();
        for i in 0..4 {
            let shared = shared.clone();
            handles.push(runtime::spawn(format!("adder{}", i), move || {
                for _ in 0..100 {
                    let mut v = shared.lock();
                    let old = *v;
                    runtime::yield_now();
                    *v = old + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*shared.lock(), 400);
    }

    #[test]
    fn condvar_hands_over_predicate_change() {
        let _fb = runtime::init();
        let slot: Arc<(Mutex<Option<u32>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));

        let consumer = {
            let slot = slot.clone();
            runtime::spawn("consumer", move || {
                let (lock, cv) = &*slot;
                let mut guard = lock.lock();
                while guard.is_none() {
                    guard = cv.wait(guard);
                }
                assert_eq!(*guard, Some(7));
            })
        };

        let producer = {
            let slot = slot.clone();
            runtime::spawn("producer", move || {
                let (lock, cv) = &*slot;
                *lock.lock() = Some(7);
                cv.notify_one();
            })
        };

        consumer.join().unwrap();
        producer.join().unwrap();
    }

    #[test]
    fn event_count_skips_park_after_notify() {
        let _fb = runtime::init();
        let ec = Arc::new(EventCount::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let ec = ec.clone();
            let hits = hits.clone();
            runtime::spawn("waiter", move || {
                let ticket = ec.prepare_wait();
                // The notifier runs before we park; the stale ticket makes
                // the wait return immediately instead of hanging.
                runtime::yield_now();
                ec.wait(ticket);
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let notifier = {
            let ec = ec.clone();
            runtime::spawn("notifier", move || {
                ec.notify_one();
            })
        };

        waiter.join().unwrap();
        notifier.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn await_until_sees_condition_flips() {
        let _fb = runtime::init();
        let ec = Arc::new(EventCount::new());
        let value = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let ec = ec.clone();
            let value = value.clone();
            runtime::spawn("waiter", move || {
                ec.await_until(|| value.load(Ordering::SeqCst) >= 3);
            })
        };

        for i in 0..3 {
            let ec = ec.clone();
            let value = value.clone();
            runtime::spawn(format!("bump{}", i), move || {
                value.fetch_add(1, Ordering::SeqCst);
                ec.notify_all();
            });
        }

        waiter.join().unwrap();
        assert!(value.load(Ordering::SeqCst) >= 3);
    }
}
