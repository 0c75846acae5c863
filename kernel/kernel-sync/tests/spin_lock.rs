use kernel_sync::SpinLock;
use std::panic;

#[test]
fn lock_mutate_and_relock() {
    let lock = SpinLock::new(0_u32);

    {
        let mut guard = lock.lock();
        *guard = 41;
    }

    // dropping the guard must have released the lock
    {
        let mut guard = lock.lock();
        *guard += 1;
        assert_eq!(*guard, 42);
    }
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(7_u8);

    let first = lock.try_lock();
    assert!(first.is_some());
    assert_eq!(**first.as_ref().unwrap(), 7);

    assert!(lock.try_lock().is_none());

    drop(first);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_releases_afterwards() {
    let lock = SpinLock::new(String::from("x"));
    let len = lock.with_lock(|s| {
        s.push('y');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(lock.with_lock(|s| s.clone()), "xy");
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = SpinLock::new(vec![1, 2]);
    lock.get_mut().push(3);
    assert_eq!(lock.lock().as_slice(), &[1, 2, 3]);
}

#[test]
fn contended_increments_are_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let in_critical = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_critical = Arc::clone(&in_critical);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    *v += 1;
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_released_on_panic() {
    let lock = SpinLock::new(0_u32);

    let caught = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|v| {
            *v = 9;
            panic!("poisoned on purpose");
        });
    }));
    assert!(caught.is_err());

    assert_eq!(lock.with_lock(|v| *v), 9);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let lock = SpinLock::new(0_u8);
    takes_sync(&lock);
}
