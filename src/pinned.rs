use crate::{Atomic, PoolHook, RefBlock};
use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};
use alloc::boxed::Box;

/// A thread-local handle holding one share of a reference-counted block.
///
/// A `Pinned<T>` guarantees the payload it references stays alive for the
/// handle's lifetime: its share is reserved before the handle ever touches
/// the block, so no concurrent removal can free the payload underneath it.
/// Handles are produced by [`Pinned::new`], by cloning, or by pinning an
/// [`Atomic`] slot with [`Atomic::pin`].
///
/// A handle is single-owner: it can be moved or cloned freely, including
/// across threads, but a single handle is never shared between threads
/// (`Pinned` is `Send` but not `Sync`). All cross-thread sharing goes
/// through [`Atomic`].
///
/// Equality between handles is pointer identity — two handles are equal iff
/// they reference the same block, regardless of payload contents.
///
/// # Examples
///
/// ```
/// use difrc::Pinned;
///
/// let a = Pinned::new("tada");
/// let b = a.clone();
/// assert_eq!(a, b);
/// assert_eq!(b.get(), Some(&"tada"));
/// ```
pub struct Pinned<T> {
    block: Option<NonNull<RefBlock<T>>>,
    phantom: PhantomData<Box<T>>,
}

unsafe impl<T: Sync + Send> Send for Pinned<T> {}

impl<T> Pinned<T> {
    /// Wraps a payload in a fresh block and takes the first share of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Pinned;
    ///
    /// let tada = Pinned::new("Tada!".to_string());
    /// assert!(!tada.is_empty());
    /// ```
    #[inline]
    pub fn new(data: T) -> Pinned<T> {
        Pinned {
            block: Some(RefBlock::new(data, 1, 0)),
            phantom: PhantomData,
        }
    }

    /// A handle referencing nothing. Equivalent to `Pinned::default()`.
    #[inline]
    #[must_use]
    pub const fn empty() -> Pinned<T> {
        Pinned {
            block: None,
            phantom: PhantomData,
        }
    }

    /// Returns `true` if this handle references nothing.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    /// Borrows the payload for the lifetime of the handle, or `None` for an
    /// empty handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Pinned;
    ///
    /// let x = Pinned::new(5);
    /// assert_eq!(x.get(), Some(&5));
    /// assert_eq!(Pinned::<i32>::empty().get(), None);
    /// ```
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        let block = self.block?;
        // Safety: this handle owns a share of the block, so the block is
        // live and the payload pointer is non-null until the last share is
        // released.
        unsafe { Some(&*block.as_ref().payload_ptr()) }
    }

    /// Gives you a pointer to the payload without consuming the handle, or
    /// null for an empty handle. The pointer stays valid as long as any
    /// share of the block exists.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        match self.block {
            Some(block) => unsafe { block.as_ref() }.payload_ptr(),
            None => ptr::null(),
        }
    }

    /// Compares if two handles reference the same block, similar to ptr::eq.
    /// Two empty handles compare equal.
    ///
    /// # Examples
    ///
    /// ```
    /// use difrc::Pinned;
    ///
    /// let five = Pinned::new(5);
    /// let same_five = five.clone();
    /// let other_five = Pinned::new(5);
    ///
    /// assert!(Pinned::ptr_eq(&five, &same_five));
    /// assert!(!Pinned::ptr_eq(&five, &other_five));
    /// ```
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.raw_block() == other.raw_block()
    }

    /// Compares this handle's block against whatever block `slot` holds at
    /// the moment of the read, without pinning.
    ///
    /// The comparison is advisory: the slot may be concurrently replaced, so
    /// the result is only meaningful when both sides are known quiescent.
    #[must_use]
    pub fn is_same_slot(&self, slot: &Atomic<T>) -> bool {
        slot.refers_to(self)
    }

    /// Installs (or clears, with `None`) the recycling hook on the
    /// referenced block.
    ///
    /// Once set, the block is handed to the hook instead of being freed when
    /// its counts reach zero. The hook must not re-publish the block into a
    /// slot the releasing thread still references.
    ///
    /// # Panics
    /// Panics if the handle is empty.
    pub fn set_pool_hook(&self, hook: Option<PoolHook<T>>) {
        match self.block {
            Some(block) => unsafe { block.as_ref() }.set_pool_hook(hook),
            None => panic!("set_pool_hook on an empty handle"),
        }
    }

    /// The recycling hook currently installed on the referenced block, if
    /// any. `None` for an empty handle.
    #[must_use]
    pub fn pool_hook(&self) -> Option<PoolHook<T>> {
        let block = self.block?;
        unsafe { block.as_ref() }.pool_hook()
    }

    /// Installs a retired block into a fresh handle without allocating,
    /// resetting its counters to a single handle-owned share. The block's
    /// pool hook, link, and payload are unchanged.
    ///
    /// # Safety
    /// `block` must be exclusively owned by the caller: a block previously
    /// handed to a [`PoolHook`], referenced by no handle or slot since.
    pub unsafe fn from_recycled(block: NonNull<RefBlock<T>>) -> Pinned<T> {
        RefBlock::reinit(block, 1, 0);
        Pinned {
            block: Some(block),
            phantom: PhantomData,
        }
    }

    #[inline(always)]
    pub(crate) fn raw_block(&self) -> *mut RefBlock<T> {
        match self.block {
            Some(block) => block.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    #[inline(always)]
    pub(crate) fn from_block(block: *mut RefBlock<T>) -> Pinned<T> {
        Pinned {
            block: NonNull::new(block),
            phantom: PhantomData,
        }
    }
}

impl<T> Clone for Pinned<T> {
    /// Takes one more share of the referenced block. A copy's share is
    /// ephemeral, symmetric with the share a slot issues to [`Atomic::pin`];
    /// adding a share needs no fence.
    #[inline]
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            let zero = unsafe { block.as_ref() }.adjust_relaxed(1, 0);
            debug_assert!(!zero);
        }
        Pinned {
            block: self.block,
            phantom: PhantomData,
        }
    }
}

impl<T> Drop for Pinned<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(block) = self.block {
            // Safety: this handle owns the ephemeral share being returned.
            unsafe { RefBlock::release(block, -1, 0) };
        }
    }
}

impl<T> Default for Pinned<T> {
    #[inline]
    fn default() -> Pinned<T> {
        Pinned::empty()
    }
}

impl<T> From<T> for Pinned<T> {
    #[inline(always)]
    fn from(data: T) -> Self {
        Pinned::new(data)
    }
}

impl<T> PartialEq for Pinned<T> {
    /// Pointer identity, not payload equality.
    #[inline]
    fn eq(&self, other: &Pinned<T>) -> bool {
        Pinned::ptr_eq(self, other)
    }
}

impl<T> Eq for Pinned<T> {}

impl<T: fmt::Debug> fmt::Debug for Pinned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(payload) => f.debug_tuple("Pinned").field(payload).finish(),
            None => f.write_str("Pinned(<empty>)"),
        }
    }
}
