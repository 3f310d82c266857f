//! Remote-ready queue: the one legal cross-thread path into a scheduler.
//!
//! Any thread may push; only the owning thread drains. Dedup against fibers
//! that are already on the ready queue happens on the drain side, so a
//! repeated publish of the same fiber is harmless.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::fiber::FiberContext;

#[derive(Default)]
pub(crate) struct RemoteReadyQueue {
    queue: SegQueue<Arc<FiberContext>>,
}

impl RemoteReadyQueue {
    pub(crate) fn push(&self, fi: Arc<FiberContext>) {
        self.queue.push(fi);
    }

    pub(crate) fn pop(&self) -> Option<Arc<FiberContext>> {
        self.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberKind;
    use std::thread;

    #[test]
    fn delivers_from_many_producers() {
        let queue = Arc::new(RemoteReadyQueue::default());
        let mut handles = Vec::new();
        for t in 0..4 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let fi =
                        FiberContext::bare(FiberKind::Worker, format!("f{}-{}", t, i));
                    queue.push(fi);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut drained = 0;
        while queue.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 400);
        assert!(queue.pop().is_none());
    }
}
