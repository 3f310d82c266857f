//! Dispatcher fiber: runs when no worker is runnable.
//!
//! The default loop feeds the ready queue from the remote queue and the
//! sleep index, round-robins itself behind ready workers, and otherwise
//! blocks on a condition variable until either remote work is announced or
//! the next sleep deadline passes. A custom [`DispatchPolicy`] can replace
//! the loop wholesale (an I/O proactor would park in its poller instead of
//! the condition variable).

use std::ptr;
use std::sync::Arc;
use std::time::Instant;

use corosensei::stack::DefaultStack;
use corosensei::Coroutine;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::fiber::{FiberContext, FiberCoroutine, FiberKind, RunState};
use crate::qsbr;
use crate::scheduler::Scheduler;

const DISPATCH_STACK_SIZE: usize = 64 * 1024;

/// Replacement for the default dispatcher loop.
///
/// `run` executes on the dispatcher fiber and owns the scheduling loop for
/// the scheduler's lifetime; it must exit once the scheduler is shut down
/// and no worker fibers remain. `notify` may be called from any thread when
/// remote work is published.
pub trait DispatchPolicy: Send + Sync {
    fn run(&self, sched: &Scheduler);
    fn notify(&self);
}

/// Wakes the dispatcher out of its idle wait.
pub(crate) struct DispatchNotifier {
    wake: Mutex<bool>,
    cv: Condvar,
}

impl DispatchNotifier {
    pub(crate) fn new() -> DispatchNotifier {
        DispatchNotifier {
            wake: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut woken = self.wake.lock();
        *woken = true;
        self.cv.notify_one();
    }

    /// Blocks until notified or, when a deadline is given, until it passes.
    pub(crate) fn wait(&self, deadline: Option<Instant>) {
        let mut woken = self.wake.lock();
        while !*woken {
            match deadline {
                Some(tp) => {
                    if self.cv.wait_until(&mut woken, tp).timed_out() {
                        break;
                    }
                }
                None => self.cv.wait(&mut woken),
            }
        }
        *woken = false;
    }
}

/// Builds the dispatcher fiber for `sched`. The context carries its own
/// stack in a single allocation owned by the coroutine.
pub(crate) fn make_dispatcher(sched: &Scheduler) -> Arc<FiberContext> {
    let ctx = FiberContext::bare(FiberKind::Dispatch, "_dispatch".to_string());
    ctx.attach_scheduler(sched);
    let weak = Arc::downgrade(&ctx);
    let sched_addr = sched as *const Scheduler as usize;
    let stack =
        DefaultStack::new(DISPATCH_STACK_SIZE).expect("failed to allocate dispatcher stack");
    let co: FiberCoroutine = Coroutine::with_stack(stack, move |yielder, ()| {
        let ctx = weak
            .upgrade()
            .expect("dispatcher context dropped while running");
        ctx.install_yielder(yielder as *const _);
        // SAFETY: the scheduler owns this dispatcher and outlives it.
        let sched = unsafe { &*(sched_addr as *const Scheduler) };

        if let Some(policy) = sched.policy() {
            policy.run(sched);
        } else {
            default_dispatch(sched);
        }

        trace!(target: "spindle.sched", "dispatcher exiting");
        ctx.install_yielder(ptr::null());
        ctx.set_run_state(RunState::Terminated);
        ctx.mark_done();
    });
    ctx.install_coroutine(co);
    ctx
}

fn default_dispatch(sched: &Scheduler) {
    loop {
        if sched.is_shutdown() && sched.num_worker_fibers() == 0 {
            break;
        }

        sched.process_remote_ready();
        if sched.has_sleeping() {
            sched.process_sleep();
        }

        if sched.has_ready() {
            sched.yield_dispatcher();
        } else {
            sched.destroy_terminated();
            sched.park_dispatcher();
        }

        sched.run_deferred();
        qsbr::checkpoint();
    }
    sched.destroy_terminated();
}
