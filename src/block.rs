use alloc::boxed::Box;
use core::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

/// Callback invoked with a block whose counts reached zero, in place of
/// deallocation.
///
/// The hook runs synchronously on the releasing thread, exactly once per
/// zero transition, and owns the block from that point on. The payload is
/// still live when the hook receives the block; a pool that decides to
/// discard a block instead of keeping it calls [`RefBlock::dealloc`].
pub type PoolHook<T> = fn(NonNull<RefBlock<T>>);

// Counter pair layout inside the one atomic word: the ephemeral count in the
// high half, the reference count in the low half, both as i32. The ephemeral
// half is transiently negative while a slot tenure is open and handles it
// issued have already dropped; the pair is read and written as a whole, so
// the (0, 0) transition is detected by exactly one operation.
const fn pack(ephemeral: i32, refs: i32) -> u64 {
    ((ephemeral as u32 as u64) << 32) | (refs as u32 as u64)
}

const fn unpack(word: u64) -> (i32, i32) {
    ((word >> 32) as i32, word as u32 as i32)
}

/// The indirection block placed between every handle and the payload.
///
/// A block owns its payload and carries the two counters of the split-count
/// scheme: the *ephemeral* count (transient shares issued through
/// [`Atomic`][crate::Atomic] slots) and the *reference* count (durable
/// shares held by handles and slots). Whichever operation drives both
/// counters to zero at once destroys the block — or hands it to the block's
/// recycling hook.
///
/// User code only ever sees `NonNull<RefBlock<T>>` at the pool boundary:
/// inside a [`PoolHook`] and in the `from_recycled` constructors of
/// [`Pinned`][crate::Pinned] and [`Atomic`][crate::Atomic].
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
pub struct RefBlock<T> {
    count: AtomicU64,
    payload: AtomicPtr<T>,
    pool: AtomicPtr<()>,
    /// Intrusive link free for use by a pool implementation.
    ///
    /// Owned by whoever owns the block while it sits in a pool; the crate
    /// itself never reads or writes it.
    pub link: AtomicPtr<RefBlock<T>>,
    _marker: PhantomData<Box<T>>,
}

impl<T> RefBlock<T> {
    pub(crate) fn new(data: T, ephemeral: i32, refs: i32) -> NonNull<RefBlock<T>> {
        let block = Box::new(RefBlock {
            count: AtomicU64::new(pack(ephemeral, refs)),
            payload: AtomicPtr::new(Box::into_raw(Box::new(data))),
            pool: AtomicPtr::new(ptr::null_mut()),
            link: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        });
        // Safety: box is always not null
        unsafe { NonNull::new_unchecked(Box::leak(block)) }
    }

    /// Adds the deltas to both counters in one fenced CAS loop and reports
    /// whether the pair reached `(0, 0)`; the caller observing `true` is the
    /// unique destroyer.
    ///
    /// A decrement that leaves the counts nonzero needs release ordering so
    /// stores into the object cannot sink below the drop; the decrement that
    /// reaches zero needs acquire ordering so the destructor's loads cannot
    /// hoist above it. A single `AcqRel` CAS covers both cases without
    /// branching on the result.
    pub(crate) fn adjust(&self, d_ephemeral: i32, d_refs: i32) -> bool {
        self.adjust_with(d_ephemeral, d_refs, Ordering::AcqRel)
    }

    /// Unfenced variant for operations that only add shares, or convert an
    /// ephemeral share into a durable one without changing their sum.
    pub(crate) fn adjust_relaxed(&self, d_ephemeral: i32, d_refs: i32) -> bool {
        self.adjust_with(d_ephemeral, d_refs, Ordering::Relaxed)
    }

    fn adjust_with(&self, d_ephemeral: i32, d_refs: i32, success: Ordering) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            let (ephemeral, refs) = unpack(current);
            let (Some(ephemeral), Some(refs)) =
                (ephemeral.checked_add(d_ephemeral), refs.checked_add(d_refs))
            else {
                panic!("reference counter overflow");
            };
            let next = pack(ephemeral, refs);
            match self
                .count
                .compare_exchange_weak(current, next, success, Ordering::Relaxed)
            {
                Ok(_) => return next == 0,
                Err(observed) => current = observed,
            }
        }
    }

    /// Fenced adjust, then destruction or recycling on the zero transition.
    ///
    /// # Safety
    /// `this` must point to a live block and the caller must own the shares
    /// being released.
    pub(crate) unsafe fn release(this: NonNull<Self>, d_ephemeral: i32, d_refs: i32) {
        if this.as_ref().adjust(d_ephemeral, d_refs) {
            match this.as_ref().pool_hook() {
                Some(hook) => hook(this),
                None => Self::dealloc(this),
            }
        }
    }

    /// Frees a block outright: drops the payload, then the block allocation.
    ///
    /// The crate calls this itself when a block without a hook reaches zero.
    /// It is public for pool implementations tearing down blocks they
    /// decided not to keep.
    ///
    /// # Safety
    /// The caller must exclusively own `this` (both counts zero, no handle
    /// or slot referencing it); the block is unusable afterwards.
    pub unsafe fn dealloc(this: NonNull<Self>) {
        let block = Box::from_raw(this.as_ptr());
        let payload = block.payload.load(Ordering::Relaxed);
        if !payload.is_null() {
            drop(Box::from_raw(payload));
        }
    }

    /// Resets a retired block's counters ahead of re-publication. The pool
    /// hook and link are left untouched.
    ///
    /// # Safety
    /// The caller must exclusively own `this`.
    pub(crate) unsafe fn reinit(this: NonNull<Self>, ephemeral: i32, refs: i32) {
        this.as_ref()
            .count
            .store(pack(ephemeral, refs), Ordering::Relaxed);
    }

    /// Second of the two dependent loads of a dereference: ordered after the
    /// block-pointer load by data dependency, with the publisher's release
    /// covering payload initialization.
    #[inline(always)]
    pub(crate) fn payload_ptr(&self) -> *mut T {
        self.payload.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pool_hook(&self, hook: Option<PoolHook<T>>) {
        let raw = match hook {
            Some(hook) => hook as *mut (),
            None => ptr::null_mut(),
        };
        self.pool.store(raw, Ordering::Release);
    }

    pub(crate) fn pool_hook(&self) -> Option<PoolHook<T>> {
        let raw = self.pool.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // Safety: non-null values of `pool` are only ever written from a
            // `PoolHook<T>` fn pointer of this exact type.
            Some(unsafe { mem::transmute::<*mut (), PoolHook<T>>(raw) })
        }
    }
}

impl<T> fmt::Debug for RefBlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ephemeral, refs) = unpack(self.count.load(Ordering::Relaxed));
        f.debug_struct("RefBlock")
            .field("ephemeral", &ephemeral)
            .field("refs", &refs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{pack, unpack};

    #[test]
    fn pack_round_trips_negative_halves() {
        for (e, r) in [(0, 0), (1, 0), (0, 1), (-3, 2), (i32::MIN, i32::MAX)] {
            assert_eq!(unpack(pack(e, r)), (e, r));
        }
    }

    #[test]
    fn zero_pair_is_the_zero_word() {
        assert_eq!(pack(0, 0), 0);
        assert_ne!(pack(-1, 1), 0);
    }
}
