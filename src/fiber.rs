//! Fiber execution contexts.
//!
//! A fiber is a stackful coroutine plus the bookkeeping the scheduler needs:
//! identity, a queue-residency tag, parking state and a pointer to the
//! owning scheduler. Context switching is provided by `corosensei`; the
//! thread's native stack acts as the main context and never owns a
//! coroutine.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};
use tracing::trace;

use crate::park;
use crate::scheduler::{self, Scheduler};
use crate::sleep::SleepKey;

/// Set while a fiber is publishing itself for a directed wakeup. The
/// notifier clears it on both hit and miss, so a fiber that has not parked
/// yet observes the cleared flag and skips suspension instead of missing
/// the notification.
pub(crate) const PARKING_IN_PROGRESS: u32 = 1;

pub(crate) type FiberCoroutine = Coroutine<(), (), ()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FiberKind {
    Main,
    Dispatch,
    Worker,
}

/// Which queue a fiber currently resides on. A live fiber is linked into at
/// most one of {ready, sleep index, parking bucket, remote queue, terminate
/// list}; `Running` means it is on none of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RunState {
    Running = 0,
    Ready = 1,
    Sleeping = 2,
    Parked = 3,
    Remote = 4,
    Terminated = 5,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Running,
            1 => RunState::Ready,
            2 => RunState::Sleeping,
            3 => RunState::Parked,
            4 => RunState::Remote,
            5 => RunState::Terminated,
            _ => unreachable!("invalid run state"),
        }
    }
}

pub(crate) struct FiberContext {
    kind: FiberKind,
    name: String,
    flags: AtomicU32,
    park_token: AtomicU64,
    run_state: AtomicU8,
    done: AtomicBool,
    panicked: AtomicBool,
    scheduler: AtomicPtr<Scheduler>,
    /// Valid only while the fiber is on the sleep index. Owner thread only.
    sleep_key: Cell<Option<SleepKey>>,
    /// Set by the entry wrapper while the coroutine runs. Owner thread only.
    yielder: Cell<*const Yielder<(), ()>>,
    /// Resumed and dropped only by the owning scheduler thread.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
}

// SAFETY: the atomics are thread-safe by construction. The Cell and
// UnsafeCell fields are accessed exclusively by the owning scheduler thread:
// `sleep_key` and `yielder` only while the fiber runs or sits on the local
// sleep index, `coroutine` only from the scheduler's resume loop. Remote
// threads move the Arc between shared queues and touch the atomics, nothing
// else.
unsafe impl Send for FiberContext {}
unsafe impl Sync for FiberContext {}

impl FiberContext {
    pub(crate) fn bare(kind: FiberKind, name: String) -> Arc<FiberContext> {
        Arc::new(FiberContext {
            kind,
            name,
            flags: AtomicU32::new(0),
            park_token: AtomicU64::new(0),
            run_state: AtomicU8::new(RunState::Running as u8),
            done: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            scheduler: AtomicPtr::new(ptr::null_mut()),
            sleep_key: Cell::new(None),
            yielder: Cell::new(ptr::null()),
            coroutine: UnsafeCell::new(None),
        })
    }

    pub(crate) fn new_main() -> Arc<FiberContext> {
        FiberContext::bare(FiberKind::Main, "main".to_string())
    }

    /// Creates a worker fiber with its own stack. The entry wrapper catches
    /// panics, wakes joiners and hands the context to the terminate list
    /// before control returns to the scheduler.
    pub(crate) fn new_worker<F>(
        name: String,
        stack_size: usize,
        f: F,
    ) -> io::Result<Arc<FiberContext>>
    where
        F: FnOnce() + Send + 'static,
    {
        let ctx = FiberContext::bare(FiberKind::Worker, name);
        let stack = DefaultStack::new(stack_size)?;
        let weak = Arc::downgrade(&ctx);
        let co: FiberCoroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            let ctx = weak.upgrade().expect("fiber context dropped while running");
            ctx.yielder.set(yielder as *const _);

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                ctx.panicked.store(true, Ordering::Release);
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                eprintln!("fiber '{}' panicked: {}", ctx.name, msg);
            }

            ctx.yielder.set(ptr::null());
            ctx.finish();
        });
        ctx.install_coroutine(co);
        Ok(ctx)
    }

    pub(crate) fn install_coroutine(&self, co: FiberCoroutine) {
        // SAFETY: called once right after construction, before the context
        // is shared with any queue or thread.
        unsafe {
            *self.coroutine.get() = Some(co);
        }
    }

    pub(crate) fn install_yielder(&self, y: *const Yielder<(), ()>) {
        self.yielder.set(y);
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn kind(&self) -> FiberKind {
        self.kind
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    pub(crate) fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_sleep_key(&self, key: Option<SleepKey>) {
        self.sleep_key.set(key);
    }

    pub(crate) fn take_sleep_key(&self) -> Option<SleepKey> {
        self.sleep_key.take()
    }

    pub(crate) fn park_token(&self) -> u64 {
        self.park_token.load(Ordering::Relaxed)
    }

    pub(crate) fn set_park_token(&self, token: u64) {
        self.park_token.store(token, Ordering::Relaxed);
    }

    pub(crate) fn begin_parking(&self) {
        self.flags.fetch_or(PARKING_IN_PROGRESS, Ordering::Relaxed);
    }

    pub(crate) fn clear_parking_flag(&self) {
        self.flags.fetch_and(!PARKING_IN_PROGRESS, Ordering::Relaxed);
    }

    pub(crate) fn parking_in_progress(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & PARKING_IN_PROGRESS != 0
    }

    pub(crate) fn attach_scheduler(&self, sched: *const Scheduler) {
        self.scheduler
            .store(sched as *mut Scheduler, Ordering::Release);
    }

    pub(crate) fn scheduler_ptr(&self) -> *const Scheduler {
        self.scheduler.load(Ordering::Acquire)
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        let p = self.scheduler_ptr();
        assert!(
            !p.is_null(),
            "fiber '{}' is not attached to a scheduler",
            self.name
        );
        // SAFETY: a scheduler outlives every fiber attached to it; the
        // pointer is written once at attach time.
        unsafe { &*p }
    }

    /// Address token of this context, used for joins and directed wakeups.
    pub(crate) fn addr_token(self: &Arc<Self>) -> u64 {
        Arc::as_ptr(self) as u64
    }

    pub(crate) fn coroutine_slot(&self) -> *mut Option<FiberCoroutine> {
        self.coroutine.get()
    }

    /// Suspends the running coroutine back to the scheduler's resume loop.
    /// Must only be called from inside this fiber's coroutine.
    pub(crate) fn suspend_to_scheduler(&self) {
        let y = self.yielder.get();
        debug_assert!(!y.is_null(), "suspend outside a running fiber");
        // SAFETY: the yielder is valid for the lifetime of the running
        // coroutine and this method is only invoked from that coroutine.
        unsafe { (*y).suspend(()) };
    }

    /// Completion hook run by the entry wrapper on the fiber's own stack.
    /// The actual stack release happens after the final switch leaves it.
    fn finish(self: &Arc<Self>) {
        trace!(target: "spindle.fiber", name = %self.name, "fiber finished");
        self.done.store(true, Ordering::Release);
        FiberContext::notify_token_all(self.addr_token());
        self.scheduler().schedule_termination(self);
    }

    // --- parking primitives ------------------------------------------------

    /// Parks this fiber on its own address until a directed wakeup arrives.
    /// Requires a preceding `begin_parking`; if the notification already
    /// landed, the validate hook observes the cleared flag and skips the
    /// suspension.
    pub(crate) fn suspend_until_wakeup(self: &Arc<Self>) {
        let token = self.addr_token();
        let parked = park::table().emplace(token, self, || !self.parking_in_progress());
        if parked {
            self.scheduler().preempt();
        }
    }

    /// Parks on a caller-supplied token unless `validate` reports the wait
    /// condition already satisfied. Returns whether a suspension occurred.
    ///
    /// `validate` runs under the bucket lock and must not touch the parking
    /// table itself.
    pub(crate) fn suspend_conditionally<V>(self: &Arc<Self>, token: u64, validate: V) -> bool
    where
        V: FnMut() -> bool,
    {
        let parked = park::table().emplace(token, self, validate);
        if parked {
            self.scheduler().preempt();
        }
        parked
    }

    /// Directed cross-thread wakeup. Clears the parking flag whether or not
    /// the target is found, closing the notify-before-park race.
    pub(crate) fn notify_parked(other: &Arc<FiberContext>) {
        let token = other.addr_token();
        let removed = park::table().remove(
            token,
            |fi| fi.clear_parking_flag(),
            || other.clear_parking_flag(),
        );
        if let Some(fi) = removed {
            debug_assert!(Arc::ptr_eq(&fi, other));
            FiberContext::activate(fi);
        }
    }

    /// Wakes at most one fiber parked on `token`.
    pub(crate) fn notify_token_one(token: u64) -> bool {
        match park::table().remove(token, |_| {}, || {}) {
            Some(fi) => {
                FiberContext::activate(fi);
                true
            }
            None => false,
        }
    }

    /// Wakes every fiber parked on `token`, in parking order.
    pub(crate) fn notify_token_all(token: u64) {
        let mut woken = VecDeque::new();
        park::table().remove_all(token, &mut woken);
        for fi in woken {
            FiberContext::activate(fi);
        }
    }

    /// Hands a freshly unparked fiber back to its scheduler: directly onto
    /// the ready queue when the caller runs on that scheduler, through the
    /// remote queue otherwise.
    pub(crate) fn activate(fi: Arc<FiberContext>) {
        let target = fi.scheduler_ptr();
        debug_assert!(!target.is_null());
        if scheduler::tl_ptr() == target {
            // SAFETY: `target` is this thread's own live scheduler.
            unsafe { (*target).add_ready(&fi) };
        } else {
            // SAFETY: a parked fiber is still owned by its scheduler, which
            // therefore cannot have been torn down yet.
            unsafe { (*target).schedule_from_remote(fi) };
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<FiberContext>>> = const { RefCell::new(None) };
}

pub(crate) fn current() -> Arc<FiberContext> {
    try_current().expect("not running inside a fiber runtime; call spindle::init() first")
}

pub(crate) fn try_current() -> Option<Arc<FiberContext>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn swap_current(fi: Option<Arc<FiberContext>>) -> Option<Arc<FiberContext>> {
    CURRENT.with(|c| c.replace(fi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parking_flag_roundtrip() {
        let fi = FiberContext::bare(FiberKind::Worker, "w".to_string());
        assert!(!fi.parking_in_progress());
        fi.begin_parking();
        assert!(fi.parking_in_progress());
        fi.clear_parking_flag();
        assert!(!fi.parking_in_progress());
    }

    #[test]
    fn run_state_tag_roundtrip() {
        let fi = FiberContext::bare(FiberKind::Worker, "w".to_string());
        assert_eq!(fi.run_state(), RunState::Running);
        for state in [
            RunState::Ready,
            RunState::Sleeping,
            RunState::Parked,
            RunState::Remote,
            RunState::Terminated,
        ] {
            fi.set_run_state(state);
            assert_eq!(fi.run_state(), state);
        }
    }

    #[test]
    fn address_tokens_are_distinct() {
        let a = FiberContext::bare(FiberKind::Worker, "a".to_string());
        let b = FiberContext::bare(FiberKind::Worker, "b".to_string());
        assert_ne!(a.addr_token(), b.addr_token());
    }
}
