use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use difrc::{Atomic, Pinned};

#[test]
fn simple() {
    let a = Pinned::new(!0usize);
    assert_eq!(a.get(), Some(&!0usize));
    drop(a);
}

#[test]
fn cloned() {
    let a = Pinned::new(!0usize);
    let b = a.clone();
    let c = a.clone();
    assert!(Pinned::ptr_eq(&a, &b));
    assert_eq!(b, c);
    let _d = a;
}

#[test]
fn empty() {
    let e = Pinned::<u32>::empty();
    assert!(e.is_empty());
    assert_eq!(e.get(), None);
    assert!(e.as_ptr().is_null());
    assert!(e.pool_hook().is_none());
    assert_eq!(e, Pinned::default());
}

#[test]
fn identity_not_value_equality() {
    let a = Pinned::new(5);
    let b = Pinned::new(5);
    assert_ne!(a, b);
    assert_eq!(a, a.clone());
    assert_ne!(a.as_ptr(), b.as_ptr());
}

#[test]
fn payload_dropped_exactly_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    struct DetectDrop;
    impl Drop for DetectDrop {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let a = Pinned::new(DetectDrop);
    let b = a.clone();
    drop(a);
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
    drop(b);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
}

#[test]
fn multithread() {
    let a = Pinned::new(!0usize);
    thread::scope(|s| {
        for _ in 0..8 {
            let a = a.clone();
            s.spawn(move || {
                if a.get() != Some(&!0) {
                    panic!("Whaaat, invalid somehow?")
                }
            });
        }
    });
}

#[test]
fn handle_slot_round_trip() {
    let handle = Pinned::new(5);
    let slot = Atomic::from(&handle);
    let again = slot.pin();
    assert_eq!(handle, again);
    assert!(handle.is_same_slot(&slot));
}
