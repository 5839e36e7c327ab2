use crate::{upair, AtomicPair, Pinned, RefBlock};
use branches::unlikely;
use core::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};
use alloc::boxed::Box;

#[cfg(target_pointer_width = "64")]
mod layout {
    use crate::upair;

    // Blocks are 16-byte aligned, freeing the pointer's low four bits, and
    // user-space virtual addresses fit in 48 bits; together that leaves the
    // top 20 bits of one usize for the outstanding-ephemeral count.
    pub(super) const PTR_SHIFT: u32 = 4;
    pub(super) const EPH_SHIFT: u32 = 44;
    pub(super) const PTR_MASK: upair = (1 << EPH_SHIFT) - 1;
    pub(super) const EPH_MAX: upair = (1 << (upair::BITS - EPH_SHIFT)) - 1;
}

#[cfg(not(target_pointer_width = "64"))]
mod layout {
    use crate::upair;

    // A genuine double-word pair: the count in the high word, the pointer in
    // the low word. The count is capped so it always converts to an i32.
    pub(super) const PTR_SHIFT: u32 = 0;
    pub(super) const EPH_SHIFT: u32 = 32;
    pub(super) const PTR_MASK: upair = (1 << EPH_SHIFT) - 1;
    pub(super) const EPH_MAX: upair = i32::MAX as upair;
}

use layout::{EPH_MAX, EPH_SHIFT, PTR_MASK, PTR_SHIFT};

// The outstanding-ephemeral count only grows while a block stays resident;
// past this threshold a pinning thread folds the count back into the block
// so the packed field cannot saturate under a long residency.
const EPH_FLUSH: upair = EPH_MAX / 2;

#[inline(always)]
fn pack<T>(eph_out: upair, block: *mut RefBlock<T>) -> upair {
    let addr = block as usize as upair;
    debug_assert_eq!(addr & !(PTR_MASK << PTR_SHIFT), 0);
    (eph_out << EPH_SHIFT) | (addr >> PTR_SHIFT)
}

#[inline(always)]
fn unpack<T>(word: upair) -> (upair, *mut RefBlock<T>) {
    let addr = (word & PTR_MASK) << PTR_SHIFT;
    (word >> EPH_SHIFT, addr as usize as *mut RefBlock<T>)
}

/// The publication point: a `(count, pointer)` pair held in one atomic word
/// and mutated only through CAS, so that the count of shares handed out
/// travels with the pointer itself.
///
/// An `Atomic<T>` is the single medium through which blocks cross threads.
/// Readers call [`pin`][Atomic::pin] to obtain a [`Pinned`] handle that
/// keeps the payload alive; writers replace the contents with
/// [`store`][Atomic::store], [`swap`][Atomic::swap], or
/// [`compare_exchange`][Atomic::compare_exchange]. The previous block is
/// destroyed (or recycled) once the last handle and the slot itself have
/// released their shares.
///
/// Publication into a slot has release ordering; a pin orders all later
/// payload reads after the pointer read. No ordering is promised between
/// unrelated slots.
///
/// # Examples
///
/// ```
/// use difrc::Atomic;
/// use std::thread;
///
/// let slot = Atomic::new(vec![1, 2, 3]);
/// thread::scope(|s| {
///     s.spawn(|| {
///         let read = slot.pin();
///         assert_eq!(read.get().map(Vec::len), Some(3));
///     });
///     s.spawn(|| {
///         slot.store(Atomic::new(vec![4, 5, 6, 7]));
///     });
/// });
/// ```
pub struct Atomic<T> {
    pair: AtomicPair,
    phantom: PhantomData<Box<T>>,
}

unsafe impl<T: Sync + Send> Send for Atomic<T> {}
unsafe impl<T: Sync + Send> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Wraps a payload in a fresh block durably owned by this slot.
    #[inline]
    pub fn new(data: T) -> Atomic<T> {
        Atomic::from_word(pack(0, RefBlock::new(data, 0, 1).as_ptr()))
    }

    /// A slot holding nothing. Pinning it yields an empty handle.
    #[inline]
    #[must_use]
    pub const fn null() -> Atomic<T> {
        Atomic {
            pair: AtomicPair::new(0),
            phantom: PhantomData,
        }
    }

    #[inline(always)]
    fn from_word(word: upair) -> Atomic<T> {
        Atomic {
            pair: AtomicPair::new(word),
            phantom: PhantomData,
        }
    }

    #[inline(always)]
    fn word(&self) -> upair {
        self.pair.load(Ordering::Relaxed)
    }

    /// Reserves one ephemeral share: a CAS loop bumping the outstanding
    /// count in the same word as the pointer, without touching the block.
    /// Acquire on success orders the block and payload reads after the
    /// pointer read, standing in for a dependent load (Rust exposes no
    /// consume ordering).
    fn acquire_share(&self) -> *mut RefBlock<T> {
        let mut current = self.word();
        loop {
            let (eph_out, block) = unpack::<T>(current);
            if block.is_null() {
                return ptr::null_mut();
            }
            if unlikely(eph_out == EPH_MAX) {
                panic!("outstanding ephemeral count saturated");
            }
            match self.pair.compare_exchange_weak(
                current,
                pack(eph_out + 1, block),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if unlikely(eph_out + 1 >= EPH_FLUSH) {
                        self.flush(block);
                    }
                    return block;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Settles this slot's outstanding-ephemeral count into the block ahead
    /// of tenure end: credit the block with every promise, then cancel the
    /// promises in the word. The settlement the slot's destructor performs
    /// with `adjust(eph_out, -1)`, done early and without the `-1`.
    ///
    /// Single-shot and opportunistic: if the word moved between the credit
    /// and the cancel — more pins arrived, or the block was replaced and the
    /// releaser already credited the same promises — the credit is taken
    /// back and the next pin past the threshold tries again.
    fn flush(&self, block: *mut RefBlock<T>) {
        let current = self.word();
        let (eph_out, current_block) = unpack::<T>(current);
        if current_block != block || eph_out == 0 {
            return;
        }
        // Safety: the caller holds an unreleased share of `block`, which
        // also keeps the pair off (0, 0) for the duration of the flush.
        let block_ref = unsafe { &*block };
        let zero = block_ref.adjust_relaxed(eph_out as i32, 0);
        debug_assert!(!zero);
        if self
            .pair
            .compare_exchange(current, pack(0, block), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            let zero = block_ref.adjust_relaxed(-(eph_out as i32), 0);
            debug_assert!(!zero);
        }
    }

    /// Reads the slot, producing a handle that keeps the observed payload
    /// alive for the handle's lifetime. Yields an empty handle when the slot
    /// is null.
    ///
    /// The share backing the handle is reserved by the same CAS that reads
    /// the pointer, so the block cannot be freed between the read and the
    /// reservation — the race this crate exists to close.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Atomic;
    ///
    /// let slot = Atomic::new(42);
    /// let read = slot.pin();
    /// assert_eq!(read.get(), Some(&42));
    ///
    /// let empty = Atomic::<i32>::null();
    /// assert!(empty.pin().is_empty());
    /// ```
    #[must_use]
    pub fn pin(&self) -> Pinned<T> {
        Pinned::from_block(self.acquire_share())
    }

    /// Replaces the contents of the slot, releasing the previous block's
    /// shares. Release ordering on the installed pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Atomic;
    ///
    /// let slot = Atomic::new(1);
    /// slot.store(Atomic::new(2));
    /// assert_eq!(slot.pin().get(), Some(&2));
    /// slot.store(Atomic::null());
    /// assert!(slot.pin().is_empty());
    /// ```
    pub fn store(&self, mut new: Atomic<T>) {
        self.swap(&mut new);
        // `new` now holds the previous pair and releases it when dropped
    }

    /// Atomically exchanges the pairs of `self` and `other` in a single
    /// swap with release ordering.
    ///
    /// The `&mut` side is the caller-local slot: a slot another thread could
    /// reach would need both sides of the exchange to be atomic, which a
    /// single swap cannot provide. The exclusive borrow makes that
    /// requirement a compile-time fact.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Atomic;
    ///
    /// let shared = Atomic::new('a');
    /// let mut local = Atomic::new('b');
    /// shared.swap(&mut local);
    /// assert_eq!(shared.pin().get(), Some(&'b'));
    /// assert_eq!(local.pin().get(), Some(&'a'));
    /// ```
    pub fn swap(&self, other: &mut Atomic<T>) {
        let new = *other.pair.get_mut();
        let previous = self.pair.swap(new, Ordering::Release);
        *other.pair.get_mut() = previous;
    }

    /// Installs `desired` iff the slot currently holds the same block as
    /// `expected` — an update-if-equal on block identity, ignoring churn of
    /// the colocated ephemeral count.
    ///
    /// The loop retries while the observed block still equals `expected`'s
    /// block (the count beside it may move under concurrent pins) and exits
    /// as soon as the identity no longer matches. On success the previous
    /// pair is released and `desired` is consumed; on failure `desired` is
    /// handed back unchanged.
    ///
    /// An empty `expected` matches a null slot, so a null slot can be
    /// populated conditionally.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Atomic;
    ///
    /// let slot = Atomic::new("one");
    /// let current = slot.pin();
    ///
    /// assert!(slot.compare_exchange(&current, Atomic::new("two")).is_ok());
    ///
    /// // `current` is now stale, so a second attempt fails and returns the
    /// // rejected value.
    /// let rejected = slot.compare_exchange(&current, Atomic::new("three"));
    /// assert!(rejected.is_err());
    /// assert_eq!(slot.pin().get(), Some(&"two"));
    /// ```
    pub fn compare_exchange(
        &self,
        expected: &Pinned<T>,
        desired: Atomic<T>,
    ) -> Result<(), Atomic<T>> {
        let expected_block = expected.raw_block();
        let desired_word = desired.word();
        let mut current = self.word();
        loop {
            let (_, block) = unpack::<T>(current);
            if block != expected_block {
                return Err(desired);
            }
            match self.pair.compare_exchange_weak(
                current,
                desired_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(previous) => {
                    // The installed pair now belongs to the slot; the
                    // previous pair is released through a temporary.
                    mem::forget(desired);
                    drop(Atomic::<T>::from_word(previous));
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether the slot currently holds the same block as `handle`.
    /// Advisory: the slot may be concurrently replaced, so the result is
    /// only meaningful when both sides are known quiescent.
    #[must_use]
    pub fn refers_to(&self, handle: &Pinned<T>) -> bool {
        let (_, block) = unpack::<T>(self.word());
        block == handle.raw_block()
    }

    /// Whether the slot currently holds nothing. Advisory, like
    /// [`refers_to`][Atomic::refers_to].
    #[must_use]
    pub fn is_null(&self) -> bool {
        let (_, block) = unpack::<T>(self.word());
        block.is_null()
    }

    /// Installs a retired block into a fresh slot without allocating,
    /// resetting its counters to a single slot-owned durable share. The
    /// block's pool hook, link, and payload are unchanged.
    ///
    /// # Safety
    /// `block` must be exclusively owned by the caller: a block previously
    /// handed to a [`PoolHook`][crate::PoolHook], referenced by no handle or
    /// slot since.
    pub unsafe fn from_recycled(block: NonNull<RefBlock<T>>) -> Atomic<T> {
        RefBlock::reinit(block, 0, 1);
        Atomic::from_word(pack(0, block.as_ptr()))
    }
}

impl<T> From<&Pinned<T>> for Atomic<T> {
    /// Acquires an additional durable share for the slot; the handle keeps
    /// its own.
    fn from(handle: &Pinned<T>) -> Atomic<T> {
        let block = handle.raw_block();
        if let Some(block) = NonNull::new(block) {
            let zero = unsafe { block.as_ref() }.adjust_relaxed(0, 1);
            debug_assert!(!zero);
        }
        Atomic::from_word(pack(0, block))
    }
}

impl<T> Clone for Atomic<T> {
    /// Snapshots the slot: the clone durably owns whatever block `self`
    /// held at the linearization point of the read.
    ///
    /// The reserved ephemeral share is migrated into one durable share on
    /// the block (`-1` ephemeral, `+1` reference in a single step, their sum
    /// unchanged); the reservation recorded in `self`'s own count settles
    /// when `self`'s tenure over the block ends.
    fn clone(&self) -> Atomic<T> {
        let block = self.acquire_share();
        if let Some(block) = NonNull::new(block) {
            let zero = unsafe { block.as_ref() }.adjust_relaxed(-1, 1);
            debug_assert!(!zero);
        }
        Atomic::from_word(pack(0, block))
    }
}

impl<T> Drop for Atomic<T> {
    fn drop(&mut self) {
        let (eph_out, block) = unpack::<T>(*self.pair.get_mut());
        if let Some(block) = NonNull::new(block) {
            // Hand back every ephemeral share this slot still owes and
            // release the slot's durable share in one step.
            // Safety: the slot owned one durable share plus the `eph_out`
            // promises recorded in its word.
            unsafe { RefBlock::release(block, eph_out as i32, -1) };
        }
    }
}

impl<T> Default for Atomic<T> {
    #[inline]
    fn default() -> Atomic<T> {
        Atomic::null()
    }
}

impl<T> From<T> for Atomic<T> {
    #[inline(always)]
    fn from(data: T) -> Self {
        Atomic::new(data)
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (eph_out, block) = unpack::<T>(self.word());
        f.debug_struct("Atomic")
            .field("eph_out", &eph_out)
            .field("block", &block)
            .finish()
    }
}
