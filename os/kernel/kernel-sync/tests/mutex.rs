use kernel_sync::{SpinMutex, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinMutex::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    *l.lock() += 1;
    assert_eq!(*l.lock(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = TicketMutex::new(1_u8);
    let g = l.try_lock().expect("free");
    assert_eq!(*g, 1);
    assert!(l.try_lock().is_none());
    drop(g);
    assert!(l.try_lock().is_some());
}

#[test]
fn failed_try_lock_leaves_the_holder_alone() {
    let spin = SpinMutex::new(0_u8);
    let held = spin.lock();
    assert!(spin.try_lock().is_none());
    assert!(spin.is_locked());
    assert!(spin.try_lock().is_none());
    drop(held);
    assert!(!spin.is_locked());

    let ticket = TicketMutex::new(0_u8);
    let held = ticket.lock();
    for _ in 0..3 {
        assert!(ticket.try_lock().is_none());
    }
    assert!(ticket.is_locked());
    drop(held);
    // the ticket counters are still in step
    assert!(!ticket.is_locked());
    *ticket.lock() += 1;
    assert_eq!(*ticket.try_lock().expect("free"), 1);
}

#[test]
fn debug_does_not_block() {
    let l = SpinMutex::new(7_u8);
    assert_eq!(format!("{l:?}"), "Mutex { value: 7 }");
    let g = l.lock();
    assert_eq!(format!("{l:?}"), "Mutex { value: <locked> }");
    assert!(l.is_locked());
    drop(g);
    assert!(!l.is_locked());
}

fn hammer<M, F>(lock: &Arc<M>, bump: F)
where
    M: Send + Sync + 'static,
    F: Fn(&M, &AtomicUsize) + Send + Sync + Copy + 'static,
{
    const THREADS: usize = 8;
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..5_000 {
                    bump(&*lock, &inside);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker");
    }
}

fn exclusive(v: &mut usize, inside: &AtomicUsize) {
    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders");
    *v += 1;
    inside.fetch_sub(1, Ordering::SeqCst);
}

#[test]
fn contended_ticket_lock_is_exclusive() {
    let lock = Arc::new(TicketMutex::new(0_usize));
    hammer(&lock, |l, inside| exclusive(&mut l.lock(), inside));
    assert_eq!(*lock.lock(), 8 * 5_000);
}

#[test]
fn contended_spin_lock_is_exclusive() {
    let lock = Arc::new(SpinMutex::new(0_usize));
    hammer(&lock, |l, inside| {
        let mut g = loop {
            if let Some(g) = l.try_lock() {
                break g;
            }
            std::hint::spin_loop();
        };
        exclusive(&mut g, inside);
    });
    assert_eq!(*lock.lock(), 8 * 5_000);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinMutex::new(0_u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut g = l.lock();
        *g = 123;
        panic!("boom");
    }));
    assert!(res.is_err());
    assert_eq!(*l.lock(), 123);
}
