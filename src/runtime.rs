//! Public fiber API: thread registration, spawn/join, yield, sleep and the
//! token wake primitives that mutexes, condition variables and event counts
//! are built from.

use std::io;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::fiber::{self, FiberContext};
use crate::qsbr::{self, ThreadSlot};
use crate::scheduler::{self, Scheduler};

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Registers the current thread with the runtime: a reclamation slot, one
/// scheduler and the main context. Every thread that runs fibers must hold
/// the returned guard for as long as it does; dropping it shuts the
/// scheduler down and unregisters the thread.
///
/// # Panics
///
/// Panics if the thread is already registered.
pub fn init() -> ThreadGuard {
    assert!(
        scheduler::tl_ptr().is_null(),
        "fiber runtime already initialized on this thread"
    );
    let slot = qsbr::register_thread();
    let sched = Box::new(Scheduler::new());
    let main = FiberContext::new_main();
    sched.attach_main(&main);
    scheduler::set_tl(&*sched);
    fiber::swap_current(Some(main.clone()));
    debug!(target: "spindle.sched", "fiber runtime initialized");
    ThreadGuard {
        sched,
        slot,
        _main: main,
        _not_send: PhantomData,
    }
}

/// Keeps the thread's scheduler alive. See [`init`].
pub struct ThreadGuard {
    sched: Box<Scheduler>,
    slot: Arc<ThreadSlot>,
    _main: Arc<FiberContext>,
    /// The scheduler is pinned to the registering thread.
    _not_send: PhantomData<*const ()>,
}

impl ThreadGuard {
    /// The scheduler owned by this thread, e.g. for attaching a custom
    /// dispatch policy.
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.sched.shutdown();
        fiber::swap_current(None);
        scheduler::set_tl(ptr::null());
        qsbr::unregister_thread(&self.slot);
    }
}

/// Why a join did not return the fiber's result.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("fiber panicked")]
    Panicked,
    #[error("a fiber cannot join itself")]
    Deadlock,
}

/// Configures a fiber before spawning it, mirroring `std::thread::Builder`.
pub struct Builder {
    name: String,
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: "fiber".to_string(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Builder {
        self.stack_size = bytes;
        self
    }

    /// Spawns the fiber on the current thread's scheduler and makes it
    /// runnable. Fails only if the stack cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics when the thread has no scheduler (missing [`init`]).
    pub fn spawn<F>(self, f: F) -> io::Result<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        scheduler::with_scheduler(|sched| {
            let ctx = FiberContext::new_worker(self.name, self.stack_size, f)?;
            sched.attach(&ctx);
            sched.add_ready(&ctx);
            Ok(JoinHandle { ctx })
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Spawns a named fiber with the default stack size.
pub fn spawn<F>(name: impl Into<String>, f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().name(name).spawn(f).expect("failed to spawn fiber")
}

/// Owning handle to a spawned fiber.
#[derive(Clone)]
pub struct JoinHandle {
    ctx: Arc<FiberContext>,
}

impl JoinHandle {
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn is_done(&self) -> bool {
        self.ctx.is_done()
    }

    /// Directed wakeup for a fiber that published itself with
    /// [`prepare_parking`] + [`suspend_until_notified`]. May be called from
    /// any registered thread (one holding a [`ThreadGuard`]), before or
    /// after the target actually parks; reclamation of the parking table's
    /// internals is only safe for registered readers.
    pub fn notify(&self) {
        FiberContext::notify_parked(&self.ctx);
    }

    /// Parks the caller until the fiber terminates. From a thread without a
    /// fiber runtime this degrades to backoff polling.
    pub fn join(self) -> Result<(), JoinError> {
        if let Some(cur) = fiber::try_current() {
            if Arc::ptr_eq(&cur, &self.ctx) {
                return Err(JoinError::Deadlock);
            }
            let token = self.ctx.addr_token();
            while !self.ctx.is_done() {
                cur.suspend_conditionally(token, || self.ctx.is_done());
            }
        } else {
            let mut backoff_us = 1u64;
            const MAX_BACKOFF_US: u64 = 1000;
            while !self.ctx.is_done() {
                thread::sleep(Duration::from_micros(backoff_us));
                backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
            }
        }
        if self.ctx.has_panicked() {
            Err(JoinError::Panicked)
        } else {
            Ok(())
        }
    }
}

/// Moves the current fiber to the back of the ready queue and runs the next
/// runnable fiber.
pub fn yield_now() {
    let cur = fiber::current();
    let sched = cur.scheduler();
    sched.add_ready(&cur);
    sched.preempt();
}

/// Suspends the current fiber until `deadline` or an earlier wake. Reaching
/// the deadline is not an error; the call simply returns.
pub fn sleep_until(deadline: Instant) {
    let cur = fiber::current();
    cur.scheduler().wait_until(deadline, &cur);
}

pub fn sleep(dur: Duration) {
    sleep_until(Instant::now() + dur);
}

/// Marks the current fiber as parking so a directed [`JoinHandle::notify`]
/// that races ahead of [`suspend_until_notified`] is not lost.
pub fn prepare_parking() {
    fiber::current().begin_parking();
}

/// Parks the current fiber on its own identity until a directed wakeup
/// arrives. If the wakeup already landed, returns without suspending.
pub fn suspend_until_notified() {
    fiber::current().suspend_until_wakeup();
}

/// Parks the current fiber on `token` unless `validate` observes the wait
/// condition already satisfied under the parking-table lock. Returns whether
/// a suspension occurred.
pub fn suspend_conditionally<V>(token: u64, validate: V) -> bool
where
    V: FnMut() -> bool,
{
    fiber::current().suspend_conditionally(token, validate)
}

/// Wakes at most one fiber parked on `token`. Returns whether one was found.
/// Like every parking-table operation, this must run on a registered thread.
pub fn notify_one(token: u64) -> bool {
    FiberContext::notify_token_one(token)
}

/// Wakes every fiber parked on `token`, in parking order. Like every
/// parking-table operation, this must run on a registered thread.
pub fn notify_all(token: u64) {
    FiberContext::notify_token_all(token)
}

/// Address token for a wait object.
pub fn token_for<T>(obj: &T) -> u64 {
    obj as *const T as u64
}
