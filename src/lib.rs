//! # Spindle: cooperative user-space fiber scheduler
//!
//! Spindle multiplexes many lightweight execution contexts (fibers) onto a
//! single OS thread with explicit stack switching. Each thread owns exactly
//! one scheduler; fibers yield only at well-defined suspension points, so
//! fibers on the same scheduler never race each other between those points.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful coroutines with their own fixed-size stacks,
//!   switched cooperatively by the per-thread scheduler.
//! - **Dispatcher**: a distinguished fiber that runs when no worker is
//!   runnable; it feeds the ready queue from the sleep index and the
//!   remote-ready queue, or blocks on a condition variable.
//! - **Parking table**: a process-wide, lock-sharded hash table that lets a
//!   fiber wait on an arbitrary 64-bit token and be woken from any thread.
//!   The table rehashes under load; retired bucket arrays are reclaimed
//!   through quiescent-state tracking (QSBR) once every thread has passed a
//!   checkpoint.
//!
//! Cross-thread interaction with a scheduler goes through exactly one door:
//! the remote-ready queue, paired with a dispatcher wakeup.
//!
//! ## Example
//!
//! ```no_run
//! let _fb = spindle::init();
//!
//! let worker = spindle::spawn("greeter", || {
//!     println!("hello from a fiber");
//!     spindle::yield_now();
//!     println!("and again");
//! });
//!
//! worker.join().unwrap();
//! ```

mod dispatch;
mod fiber;
mod park;
mod qsbr;
mod remote;
mod runtime;
mod scheduler;
mod sleep;
pub mod sync;

pub use dispatch::DispatchPolicy;
pub use park::{park_stats, ParkStats};
pub use runtime::{
    init, notify_all, notify_one, prepare_parking, sleep, sleep_until, spawn,
    suspend_conditionally, suspend_until_notified, token_for, yield_now, Builder, JoinError,
    JoinHandle, ThreadGuard,
};
pub use scheduler::Scheduler;
