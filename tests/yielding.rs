//! Cooperative interleaving on a single scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn two_fibers_interleave_round_robin() {
    let _fb = spindle::init();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let log = log.clone();
        spindle::spawn("a", move || {
            log.lock().unwrap().push("a");
            spindle::yield_now();
            log.lock().unwrap().push("a2");
        })
    };
    let b = {
        let log = log.clone();
        spindle::spawn("b", move || {
            log.lock().unwrap().push("b");
            spindle::yield_now();
            log.lock().unwrap().push("b2");
        })
    };

    a.join().unwrap();
    b.join().unwrap();
    assert_eq!(*log.lock().unwrap(), ["a", "b", "a2", "b2"]);
}

#[test]
fn broadcast_wakes_every_waiter_once_in_park_order() {
    let _fb = spindle::init();
    let token_obj = Box::new(0u8);
    let token = spindle::token_for(&*token_obj);

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let wake_count = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for i in 0..100 {
        let order = order.clone();
        let wake_count = wake_count.clone();
        waiters.push(spindle::spawn(format!("w{}", i), move || {
            spindle::suspend_conditionally(token, || false);
            wake_count.fetch_add(1, Ordering::SeqCst);
            order.lock().unwrap().push(i);
        }));
    }

    // Give every waiter one scheduling round to reach the parking table.
    spindle::yield_now();
    assert_eq!(wake_count.load(Ordering::SeqCst), 0);

    spindle::notify_all(token);
    for w in waiters {
        w.join().unwrap();
    }

    let order = order.lock().unwrap();
    assert_eq!(wake_count.load(Ordering::SeqCst), 100);
    assert_eq!(*order, (0..100).collect::<Vec<_>>());
}

#[test]
fn deep_spawn_chain_completes() {
    let _fb = spindle::init();
    let depth = Arc::new(AtomicUsize::new(0));

    fn descend(depth: Arc<AtomicUsize>, level: usize) {
        depth.fetch_max(level, Ordering::SeqCst);
        if level < 20 {
            let next = depth.clone();
            spindle::spawn(format!("level{}", level + 1), move || {
                descend(next, level + 1);
            })
            .join()
            .unwrap();
        }
    }

    let d = depth.clone();
    spindle::spawn("level1", move || descend(d, 1)).join().unwrap();
    assert_eq!(depth.load(Ordering::SeqCst), 20);
}
