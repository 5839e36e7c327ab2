use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use difrc::{Atomic, Pinned, PoolHook, RefBlock};

static CREATED: AtomicUsize = AtomicUsize::new(0);
static DROPPED: AtomicUsize = AtomicUsize::new(0);
static RETURNS: AtomicUsize = AtomicUsize::new(0);

struct Buf {
    fill: u8,
}
impl Buf {
    fn new(fill: u8) -> Buf {
        CREATED.fetch_add(1, Ordering::SeqCst);
        Buf { fill }
    }
}
impl Drop for Buf {
    fn drop(&mut self) {
        DROPPED.fetch_add(1, Ordering::SeqCst);
    }
}

// Retired blocks land here, payload intact. A mutex-backed freelist keeps
// the harness simple; the `link` field on RefBlock supports an intrusive
// list when the pool itself must be lock-free.
static POOL: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn stash(block: NonNull<RefBlock<Buf>>) {
    RETURNS.fetch_add(1, Ordering::SeqCst);
    POOL.lock().unwrap().push(block.as_ptr() as usize);
}

fn take() -> Option<NonNull<RefBlock<Buf>>> {
    let addr = POOL.lock().unwrap().pop()?;
    NonNull::new(addr as *mut RefBlock<Buf>)
}

#[test]
fn recycling_reaches_steady_state() {
    const CYCLES: usize = 100;

    let slot = Atomic::<Buf>::null();

    let seeded = Pinned::new(Buf::new(0xAB));
    seeded.set_pool_hook(Some(stash as PoolHook<Buf>));
    assert!(seeded.pool_hook().is_some());
    let payload_addr = seeded.as_ptr();
    slot.store(Atomic::from(&seeded));
    drop(seeded);

    for cycle in 0..CYCLES {
        // the slot held the only share, so clearing it retires the block
        slot.store(Atomic::null());
        assert_eq!(RETURNS.load(Ordering::SeqCst), cycle + 1);

        let block = take().expect("the retired block reached the pool");
        slot.store(unsafe { Atomic::from_recycled(block) });

        // same storage every cycle: no allocation, no payload churn
        let read = slot.pin();
        assert_eq!(read.as_ptr(), payload_addr);
        assert_eq!(read.get().map(|b| b.fill), Some(0xAB));
    }

    assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(DROPPED.load(Ordering::SeqCst), 0);

    // detach the hook so the final release frees for real
    let last = slot.pin();
    last.set_pool_hook(None);
    drop(last);
    drop(slot);

    assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    assert!(POOL.lock().unwrap().is_empty());
}
