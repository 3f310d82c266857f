//! Sleep-queue ordering and wake-before-timeout behavior.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn sleepers_resume_in_deadline_order_at_or_after_deadline() {
    let _fb = spindle::init();
    let wakes: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();

    let mut handles = Vec::new();
    for (name, ms) in [("f1", 30u64), ("f2", 10), ("f3", 20)] {
        let wakes = wakes.clone();
        let deadline = base + Duration::from_millis(ms);
        handles.push(spindle::spawn(name, move || {
            spindle::sleep_until(deadline);
            wakes.lock().unwrap().push((name, Instant::now()));
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let wakes = wakes.lock().unwrap();
    let order: Vec<_> = wakes.iter().map(|(n, _)| *n).collect();
    assert_eq!(order, ["f2", "f3", "f1"]);
    for (name, woke_at) in wakes.iter() {
        let deadline = match *name {
            "f1" => base + Duration::from_millis(30),
            "f2" => base + Duration::from_millis(10),
            _ => base + Duration::from_millis(20),
        };
        assert!(*woke_at >= deadline, "{} woke before its deadline", name);
    }
}

#[test]
fn past_deadline_returns_promptly() {
    let _fb = spindle::init();
    let h = spindle::spawn("expired", || {
        spindle::sleep_until(Instant::now() - Duration::from_millis(5));
    });
    let start = Instant::now();
    h.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn notify_wakes_sleeper_before_deadline() {
    let _fb = spindle::init();
    let token_obj = Box::new(0u8);
    let token = spindle::token_for(&*token_obj);
    let start = Instant::now();

    // The waiter parks rather than sleeps; the notifying fiber wakes it long
    // before the fallback deadline another fiber is sleeping towards.
    let waiter = spindle::spawn("waiter", move || {
        spindle::suspend_conditionally(token, || false);
    });
    let _clock = spindle::spawn("clock", || {
        spindle::sleep(Duration::from_millis(200));
    });
    let notifier = spindle::spawn("notifier", move || {
        spindle::notify_one(token);
    });

    waiter.join().unwrap();
    notifier.join().unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(150),
        "waiter should not have waited for the sleeper's deadline"
    );
}
