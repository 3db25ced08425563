use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reactor_server::timer::TimerHeap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn noop() -> Box<dyn FnOnce() + Send> {
    Box::new(|| {})
}

#[test]
fn test_heap_property_under_random_operations() {
    let mut rng = StdRng::seed_from_u64(42);
    let base = Instant::now();
    let mut heap: TimerHeap<u32> = TimerHeap::new();
    let mut model: HashMap<u32, Instant> = HashMap::new();

    for _ in 0..2000 {
        let id = rng.gen_range(0..64);
        let expires = base + Duration::from_millis(rng.gen_range(0..10_000));
        match rng.gen_range(0..3) {
            0 => {
                heap.add_at(id, expires, noop());
                model.insert(id, expires);
            }
            1 => {
                heap.adjust_at(id, expires);
                if let Some(e) = model.get_mut(&id) {
                    *e = expires;
                }
            }
            _ => {
                assert_eq!(heap.remove(id), model.remove(&id).is_some());
            }
        }

        assert!(heap.is_consistent());
        assert_eq!(heap.len(), model.len());
        let earliest = model.values().min().map(|e| e.duration_since(base));
        assert_eq!(heap.next_wake(base), earliest);
        for (&id, &expires) in &model {
            assert_eq!(heap.expiry(id), Some(expires));
        }
    }
}

#[test]
fn test_tick_fires_due_timers_in_order_once() {
    let base = Instant::now();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut heap = TimerHeap::new();

    for (id, ms) in [(1u32, 30u64), (2, 10), (3, 20), (4, 500)] {
        let fired = Arc::clone(&fired);
        heap.add_at(
            id,
            base + Duration::from_millis(ms),
            Box::new(move || fired.lock().unwrap().push(id)),
        );
    }

    assert_eq!(heap.tick(base + Duration::from_millis(30)), 3);
    assert_eq!(*fired.lock().unwrap(), vec![2, 3, 1]);

    // already fired timers are gone
    assert_eq!(heap.tick(base + Duration::from_millis(30)), 0);
    assert_eq!(heap.len(), 1);
    assert!(heap.contains(4));
    assert!(heap.is_consistent());
}

#[test]
fn test_removed_timer_never_fires() {
    let base = Instant::now();
    let count = Arc::new(AtomicUsize::new(0));
    let mut heap = TimerHeap::new();

    let c = Arc::clone(&count);
    heap.add_at(7u32, base, Box::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(heap.remove(7));
    assert!(!heap.remove(7));

    heap.tick(base + Duration::from_secs(1));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fired_timer_cannot_fire_again_after_remove() {
    let base = Instant::now();
    let count = Arc::new(AtomicUsize::new(0));
    let mut heap = TimerHeap::new();

    let c = Arc::clone(&count);
    heap.add_at(1u32, base, Box::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));
    heap.tick(base);
    // the close path removes the timer after it fired
    assert!(!heap.remove(1));
    heap.tick(base + Duration::from_secs(5));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_adding_existing_id_replaces_timer() {
    let base = Instant::now();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut heap = TimerHeap::new();

    let f = Arc::clone(&fired);
    heap.add_at(1u32, base, Box::new(move || f.lock().unwrap().push("old")));
    let f = Arc::clone(&fired);
    heap.add_at(1u32, base + Duration::from_millis(50), Box::new(move || f.lock().unwrap().push("new")));

    assert_eq!(heap.len(), 1);
    assert_eq!(heap.tick(base), 0);
    assert_eq!(heap.tick(base + Duration::from_millis(50)), 1);
    assert_eq!(*fired.lock().unwrap(), vec!["new"]);
}

#[test]
fn test_sliding_adjust_postpones_expiry() {
    let base = Instant::now();
    let mut heap = TimerHeap::new();
    heap.add_at(1u32, base + Duration::from_millis(10), noop());
    heap.add_at(2u32, base + Duration::from_millis(20), noop());

    heap.adjust_at(1, base + Duration::from_millis(100));
    assert_eq!(heap.next_wake(base), Some(Duration::from_millis(20)));
    assert_eq!(heap.tick(base + Duration::from_millis(50)), 1);
    assert!(heap.contains(1));
}

#[test]
fn test_adjust_and_remove_of_unknown_id_are_noops() {
    let mut heap: TimerHeap<u32> = TimerHeap::new();
    heap.adjust(99, Duration::from_secs(1));
    assert!(!heap.remove(99));
    assert!(heap.is_empty());
}

#[test]
fn test_next_wake_ms() {
    let base = Instant::now();
    let mut heap = TimerHeap::new();
    assert_eq!(heap.next_wake_ms(base), -1);

    heap.add_at(1u32, base + Duration::from_micros(1500), noop());
    // rounded up so the poller never wakes before the expiry
    assert_eq!(heap.next_wake_ms(base), 2);

    // overdue timers ask for an immediate wakeup
    assert_eq!(heap.next_wake_ms(base + Duration::from_secs(1)), 0);
}
