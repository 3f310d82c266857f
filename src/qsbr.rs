//! Quiescent-state-based reclamation.
//!
//! Retired shared structures (old parking-table bucket arrays) may still be
//! read by threads that loaded the pointer before it was swapped. Instead of
//! reference counting every read, each thread periodically announces a
//! quiescent state; a retired object is freed once every registered thread
//! has either announced the retirement epoch or gone offline.
//!
//! The global epoch starts at 1 and advances by 2 per retirement, so a live
//! epoch value is always odd and never collides with `0`, which marks an
//! offline thread.

use std::cell::RefCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

pub(crate) const EPOCH_INC: u64 = 2;

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Vec<Arc<ThreadSlot>>> = Mutex::new(Vec::new());
}

thread_local! {
    static TL_SLOT: RefCell<Option<Arc<ThreadSlot>>> = const { RefCell::new(None) };
}

/// Per-thread epoch slot. `local_epoch == 0` means the thread is offline and
/// cannot be holding references to retired data.
pub(crate) struct ThreadSlot {
    local_epoch: AtomicU64,
}

/// Bumps the global epoch for a new retirement and returns the epoch the
/// retired object must wait for.
pub(crate) fn advance_epoch() -> u64 {
    GLOBAL_EPOCH.fetch_add(EPOCH_INC, Ordering::Relaxed) + EPOCH_INC
}

/// Registers the current thread and brings it online.
pub(crate) fn register_thread() -> Arc<ThreadSlot> {
    let slot = Arc::new(ThreadSlot {
        local_epoch: AtomicU64::new(0),
    });
    REGISTRY.lock().push(slot.clone());
    TL_SLOT.with(|tl| {
        let mut tl = tl.borrow_mut();
        assert!(tl.is_none(), "thread already registered for reclamation");
        *tl = Some(slot.clone());
    });
    online();
    slot
}

/// Removes the thread from the registry. The slot goes offline first so a
/// concurrent sync never waits on a dying thread.
pub(crate) fn unregister_thread(slot: &Arc<ThreadSlot>) {
    offline();
    TL_SLOT.with(|tl| *tl.borrow_mut() = None);
    let mut reg = REGISTRY.lock();
    reg.retain(|s| !Arc::ptr_eq(s, slot));
}

/// Announces a quiescent state: the thread holds no references to data
/// retired before the epoch it stores here.
pub(crate) fn checkpoint() {
    fence(Ordering::SeqCst);
    let epoch = GLOBAL_EPOCH.load(Ordering::Relaxed);
    TL_SLOT.with(|tl| {
        if let Some(slot) = tl.borrow().as_ref() {
            slot.local_epoch.store(epoch, Ordering::Relaxed);
        }
    });
}

pub(crate) fn online() {
    let epoch = GLOBAL_EPOCH.load(Ordering::Relaxed);
    TL_SLOT.with(|tl| {
        if let Some(slot) = tl.borrow().as_ref() {
            slot.local_epoch.store(epoch, Ordering::Relaxed);
        }
    });
    fence(Ordering::SeqCst);
}

pub(crate) fn offline() {
    fence(Ordering::Release);
    TL_SLOT.with(|tl| {
        if let Some(slot) = tl.borrow().as_ref() {
            slot.local_epoch.store(0, Ordering::Relaxed);
        }
    });
}

fn quiesced(slots: &[Arc<ThreadSlot>], target: u64) -> bool {
    slots.iter().all(|slot| {
        let local = slot.local_epoch.load(Ordering::Relaxed);
        // A thread that checkpointed at a later epoch has necessarily
        // passed `target` as well.
        local == 0 || local >= target
    })
}

/// Returns true iff every registered thread is offline or has announced
/// `target` (or a later epoch). Non-blocking: returns false when the
/// registry lock is contended, the caller retries on a later tick.
pub(crate) fn sync(target: u64) -> bool {
    let Some(reg) = REGISTRY.try_lock() else {
        return false;
    };

    TL_SLOT.with(|tl| {
        if let Some(slot) = tl.borrow().as_ref() {
            slot.local_epoch.store(target, Ordering::Relaxed);
        }
    });

    let done = quiesced(&reg, target);
    if done {
        trace!(target: "spindle.qsbr", epoch = target, "grace period complete");
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(epoch: u64) -> Arc<ThreadSlot> {
        Arc::new(ThreadSlot {
            local_epoch: AtomicU64::new(epoch),
        })
    }

    #[test]
    fn epoch_parity_is_preserved() {
        let before = GLOBAL_EPOCH.load(Ordering::Relaxed);
        assert_eq!(before % 2, 1);
        let retired = advance_epoch();
        assert_eq!(retired % 2, 1);
        assert!(retired > before);
    }

    #[test]
    fn offline_threads_do_not_block_quiescence() {
        let slots = [slot_at(0), slot_at(9), slot_at(0)];
        assert!(quiesced(&slots, 9));
    }

    #[test]
    fn stale_online_thread_blocks_quiescence() {
        let slots = [slot_at(9), slot_at(7)];
        assert!(!quiesced(&slots, 9));
        slots[1].local_epoch.store(9, Ordering::Relaxed);
        assert!(quiesced(&slots, 9));
    }

    #[test]
    fn later_checkpoint_counts_as_passed() {
        let slots = [slot_at(11)];
        assert!(quiesced(&slots, 9));
    }

    #[test]
    fn checkpoint_tracks_global() {
        let slot = register_thread();
        let target = advance_epoch();
        checkpoint();
        assert_eq!(slot.local_epoch.load(Ordering::Relaxed), target);
        unregister_thread(&slot);
        assert_eq!(slot.local_epoch.load(Ordering::Relaxed), 0);
    }
}
