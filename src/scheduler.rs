//! Per-thread fiber scheduler.
//!
//! Exactly one scheduler exists per registered thread. It owns the ready
//! queue, the sleep index, the terminate list and the dispatcher fiber, and
//! runs its fibers from a resume loop on the main context's stack. The only
//! cross-thread entry point is [`Scheduler::schedule_from_remote`].

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corosensei::CoroutineResult;
use tracing::{debug, trace, warn};

use crate::dispatch::{self, DispatchNotifier, DispatchPolicy};
use crate::fiber::{self, FiberContext, FiberKind, RunState};
use crate::qsbr;
use crate::remote::RemoteReadyQueue;
use crate::sleep::SleepIndex;

thread_local! {
    static TL_SCHED: Cell<*const Scheduler> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn set_tl(sched: *const Scheduler) {
    TL_SCHED.with(|c| c.set(sched));
}

pub(crate) fn tl_ptr() -> *const Scheduler {
    TL_SCHED.with(|c| c.get())
}

pub(crate) fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    try_with_scheduler(f).expect("no fiber scheduler on this thread; call spindle::init() first")
}

pub(crate) fn try_with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
    let p = tl_ptr();
    if p.is_null() {
        None
    } else {
        // SAFETY: the thread-local pointer is cleared before the scheduler
        // it names is destroyed.
        Some(f(unsafe { &*p }))
    }
}

type DeferredFn = Box<dyn FnOnce()>;

const SHUTDOWN_DEFER_RETRIES: usize = 10_000;

pub struct Scheduler {
    ready_queue: RefCell<VecDeque<Arc<FiberContext>>>,
    sleep_index: RefCell<SleepIndex>,
    terminate_queue: RefCell<Vec<Arc<FiberContext>>>,
    /// Deferred reclamations, most recent epoch at the back.
    deferred: RefCell<Vec<(u64, DeferredFn)>>,
    remote_ready: RemoteReadyQueue,
    notifier: DispatchNotifier,
    dispatcher: RefCell<Option<Arc<FiberContext>>>,
    main_cntx: RefCell<Option<Arc<FiberContext>>>,
    policy: UnsafeCell<Option<Box<dyn DispatchPolicy>>>,
    policy_set: AtomicBool,
    num_workers: Cell<usize>,
    shutdown: Cell<bool>,
}

// SAFETY: all scheduler state is owned by one thread. The only operations
// remote threads perform are `schedule_from_remote` and `policy().notify()`,
// which touch the lock-free remote queue, the notifier and the write-once
// policy slot, never the RefCell/Cell state.
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            ready_queue: RefCell::new(VecDeque::new()),
            sleep_index: RefCell::new(SleepIndex::default()),
            terminate_queue: RefCell::new(Vec::new()),
            deferred: RefCell::new(Vec::new()),
            remote_ready: RemoteReadyQueue::default(),
            notifier: DispatchNotifier::new(),
            dispatcher: RefCell::new(None),
            main_cntx: RefCell::new(None),
            policy: UnsafeCell::new(None),
            policy_set: AtomicBool::new(false),
            num_workers: Cell::new(0),
            shutdown: Cell::new(false),
        }
    }

    /// One-time init: adopts the thread's main context and constructs the
    /// dispatcher fiber. The scheduler must already live at its final
    /// address.
    pub(crate) fn attach_main(&self, main: &Arc<FiberContext>) {
        assert!(
            self.main_cntx.borrow().is_none(),
            "scheduler already has a main context"
        );
        main.attach_scheduler(self);
        *self.main_cntx.borrow_mut() = Some(main.clone());
        *self.dispatcher.borrow_mut() = Some(dispatch::make_dispatcher(self));
    }

    /// Registers a newly spawned fiber with this scheduler.
    pub(crate) fn attach(&self, ctx: &Arc<FiberContext>) {
        ctx.attach_scheduler(self);
        if ctx.kind() == FiberKind::Worker {
            self.num_workers.set(self.num_workers.get() + 1);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    pub fn num_worker_fibers(&self) -> usize {
        self.num_workers.get()
    }

    // --- ready queue -------------------------------------------------------

    /// Appends a fiber to the ready queue. A fiber woken before its sleep
    /// deadline is pulled off the sleep index first.
    pub(crate) fn add_ready(&self, fi: &Arc<FiberContext>) {
        match fi.run_state() {
            RunState::Ready => return,
            RunState::Sleeping => {
                if let Some(key) = fi.take_sleep_key() {
                    self.sleep_index.borrow_mut().remove(key);
                }
            }
            RunState::Terminated => {
                debug_assert!(false, "ready-queueing a terminated fiber");
                return;
            }
            _ => {}
        }
        fi.set_run_state(RunState::Ready);
        self.ready_queue.borrow_mut().push_back(fi.clone());
    }

    pub fn has_ready(&self) -> bool {
        !self.ready_queue.borrow().is_empty()
    }

    fn pop_ready(&self) -> Option<Arc<FiberContext>> {
        self.ready_queue.borrow_mut().pop_front()
    }

    // --- cross-thread entry ------------------------------------------------

    /// Publishes a fiber from another thread and pokes the dispatcher (or
    /// the custom policy) so a sleeping scheduler notices.
    pub(crate) fn schedule_from_remote(&self, fi: Arc<FiberContext>) {
        trace!(target: "spindle.sched", name = %fi.name(), "schedule from remote");
        fi.set_run_state(RunState::Remote);
        self.remote_ready.push(fi);
        if let Some(policy) = self.policy() {
            policy.notify();
        } else {
            self.notifier.notify();
        }
    }

    /// Drains the remote queue into the ready queue. A publisher may
    /// re-deliver a fiber that is already ready; duplicates are dropped.
    pub fn process_remote_ready(&self) {
        while let Some(fi) = self.remote_ready.pop() {
            if fi.run_state() == RunState::Ready {
                continue;
            }
            self.add_ready(&fi);
        }
    }

    // --- sleeping ----------------------------------------------------------

    /// Puts the current fiber to sleep until `deadline` or an earlier
    /// `add_ready` wake.
    pub(crate) fn wait_until(&self, deadline: Instant, me: &Arc<FiberContext>) {
        debug_assert_eq!(me.run_state(), RunState::Running);
        let key = self.sleep_index.borrow_mut().insert(deadline, me.clone());
        me.set_sleep_key(Some(key));
        me.set_run_state(RunState::Sleeping);
        self.preempt();
    }

    /// Moves every ripe sleeper to the ready queue, earliest deadline first.
    pub fn process_sleep(&self) {
        let now = Instant::now();
        loop {
            let ripe = self.sleep_index.borrow_mut().pop_ripe(now);
            let Some(fi) = ripe else { break };
            trace!(target: "spindle.sched", name = %fi.name(), "sleep deadline reached");
            fi.set_sleep_key(None);
            fi.set_run_state(RunState::Ready);
            self.ready_queue.borrow_mut().push_back(fi);
        }
    }

    pub fn has_sleeping(&self) -> bool {
        !self.sleep_index.borrow().is_empty()
    }

    pub fn next_sleep_point(&self) -> Option<Instant> {
        self.sleep_index.borrow().next_deadline()
    }

    // --- switching ---------------------------------------------------------

    /// Yields the CPU. The next runnable fiber is the ready-queue head, the
    /// dispatcher when nothing is ready. The caller must already have
    /// recorded its own post-switch residency (ready, sleeping, parked).
    pub(crate) fn preempt(&self) {
        let cur = fiber::current();
        if cur.kind() == FiberKind::Main {
            self.dispatch_until_main_ready();
        } else {
            cur.suspend_to_scheduler();
        }
    }

    /// Resume loop on the main context's stack: runs ready fibers and the
    /// dispatcher until the main context itself is popped from the ready
    /// queue.
    fn dispatch_until_main_ready(&self) {
        loop {
            let next = self.pick_next();
            if next.kind() == FiberKind::Main {
                next.set_run_state(RunState::Running);
                return;
            }
            self.resume_fiber(&next);
        }
    }

    fn pick_next(&self) -> Arc<FiberContext> {
        self.pop_ready().unwrap_or_else(|| self.dispatcher_ctx())
    }

    fn dispatcher_ctx(&self) -> Arc<FiberContext> {
        self.dispatcher
            .borrow()
            .as_ref()
            .expect("scheduler missing its dispatcher")
            .clone()
    }

    fn resume_fiber(&self, fi: &Arc<FiberContext>) {
        debug_assert!(fi.kind() != FiberKind::Main);
        fi.set_run_state(RunState::Running);
        let prev = fiber::swap_current(Some(fi.clone()));
        trace!(target: "spindle.sched", name = %fi.name(), "switching to fiber");
        // SAFETY: the coroutine slot is only touched by the owning thread,
        // and only while the fiber is suspended.
        let finished = unsafe {
            let slot = &mut *fi.coroutine_slot();
            let co = slot.as_mut().expect("resuming a completed fiber");
            matches!(co.resume(()), CoroutineResult::Return(()))
        };
        fiber::swap_current(prev);
        if finished {
            // Control has left the fiber's stack for good; release it.
            // SAFETY: as above.
            unsafe { *fi.coroutine_slot() = None };
        }
    }

    // --- termination -------------------------------------------------------

    /// Queues a finished fiber for release. The stack is freed by the resume
    /// loop once the final switch has left it.
    pub(crate) fn schedule_termination(&self, fi: &Arc<FiberContext>) {
        fi.set_run_state(RunState::Terminated);
        self.terminate_queue.borrow_mut().push(fi.clone());
        if fi.kind() == FiberKind::Worker {
            self.num_workers.set(self.num_workers.get() - 1);
        }
    }

    /// Releases the scheduler's reference on terminated fibers. Join handles
    /// may keep the contexts alive past this point.
    pub fn destroy_terminated(&self) {
        let drained: Vec<_> = self.terminate_queue.borrow_mut().drain(..).collect();
        for fi in drained {
            trace!(target: "spindle.sched", name = %fi.name(), "releasing terminated fiber");
            drop(fi);
        }
    }

    // --- deferred reclamation ----------------------------------------------

    pub(crate) fn defer(&self, epoch: u64, cb: DeferredFn) {
        self.deferred.borrow_mut().push((epoch, cb));
    }

    /// Runs deferred reclamations whose grace period has completed, newest
    /// first. Once the newest entry passes, the older ones carry equal or
    /// earlier epochs and fire without rechecking.
    pub fn run_deferred(&self) {
        let mut unchecked = false;
        loop {
            let epoch = {
                let q = self.deferred.borrow();
                match q.last() {
                    Some((epoch, _)) => *epoch,
                    None => break,
                }
            };
            if !unchecked && !qsbr::sync(epoch) {
                break;
            }
            unchecked = true;
            let (_, cb) = self.deferred.borrow_mut().pop().expect("deferred entry");
            cb();
        }
    }

    // --- dispatcher support ------------------------------------------------

    /// Installs a replacement for the default dispatch loop. May be called
    /// at most once, before the dispatcher first runs.
    pub fn attach_custom_policy(&self, policy: Box<dyn DispatchPolicy>) {
        assert!(
            !self.policy_set.load(Ordering::Relaxed),
            "a dispatch policy may be attached at most once"
        );
        // SAFETY: the slot is written exactly once, before the flag is
        // published with Release; readers check the flag with Acquire.
        unsafe { *self.policy.get() = Some(policy) };
        self.policy_set.store(true, Ordering::Release);
    }

    pub(crate) fn policy(&self) -> Option<&dyn DispatchPolicy> {
        if !self.policy_set.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: written once before the flag was published.
        unsafe { (*self.policy.get()).as_deref() }
    }

    /// Requeues the dispatcher behind the currently ready fibers and
    /// switches to the head, so the dispatcher gets the CPU back after one
    /// round. Must be called from the dispatcher fiber.
    pub fn yield_dispatcher(&self) {
        let d = self.dispatcher_ctx();
        debug_assert!(Arc::ptr_eq(&fiber::current(), &d));
        self.add_ready(&d);
        d.suspend_to_scheduler();
    }

    /// Wakes a dispatcher blocked in [`park_dispatcher`](Self::park_dispatcher).
    /// A custom policy that reuses `park_dispatcher` for its idle wait must
    /// forward its `notify` here.
    pub fn notify_dispatcher(&self) {
        self.notifier.notify();
    }

    /// Blocks the dispatcher (and with it the thread) until remote work is
    /// announced or the next sleep deadline passes. The thread counts as
    /// offline for reclamation purposes while it sleeps.
    pub fn park_dispatcher(&self) {
        let deadline = self.next_sleep_point();
        qsbr::offline();
        self.notifier.wait(deadline);
        qsbr::online();
    }

    // --- teardown ----------------------------------------------------------

    /// Final cooperative run: drains the ready queue, drives the dispatcher
    /// until it exits (which requires every worker to have terminated), then
    /// releases everything.
    pub(crate) fn shutdown(&self) {
        debug!(target: "spindle.sched", "scheduler shutting down");
        debug_assert!(fiber::try_current()
            .zip(self.main_cntx.borrow().clone())
            .map_or(false, |(cur, main)| Arc::ptr_eq(&cur, &main)));
        self.shutdown.set(true);

        loop {
            match self.pop_ready() {
                Some(fi) => {
                    debug_assert!(fi.kind() != FiberKind::Main);
                    self.resume_fiber(&fi);
                }
                None => {
                    let d = self.dispatcher_ctx();
                    if d.is_done() {
                        break;
                    }
                    self.resume_fiber(&d);
                }
            }
        }
        assert_eq!(
            self.num_workers.get(),
            0,
            "scheduler destroyed with live worker fibers"
        );
        self.destroy_terminated();
        self.drain_deferred_blocking();
        *self.dispatcher.borrow_mut() = None;
        *self.main_cntx.borrow_mut() = None;
    }

    /// Deferred reclamations still pending at teardown get a bounded number
    /// of grace-period retries; anything that never becomes safe is leaked
    /// rather than freed under a concurrent reader.
    fn drain_deferred_blocking(&self) {
        for _ in 0..SHUTDOWN_DEFER_RETRIES {
            self.run_deferred();
            if self.deferred.borrow().is_empty() {
                return;
            }
            qsbr::checkpoint();
            std::thread::yield_now();
        }
        let pending = self.deferred.borrow().len();
        if pending > 0 {
            warn!(
                target: "spindle.sched",
                pending, "deferred reclamations never became safe; leaking"
            );
            self.deferred.borrow_mut().clear();
        }
    }
}
