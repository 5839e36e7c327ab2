#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

extern crate alloc;

#[cfg(target_pointer_width = "64")]
pub(crate) use core::sync::atomic::AtomicUsize as AtomicPair;
#[cfg(target_pointer_width = "64")]
pub(crate) use usize as upair;

#[cfg(not(target_pointer_width = "64"))]
pub(crate) use core::sync::atomic::AtomicU64 as AtomicPair;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) use u64 as upair;

mod atomic;
mod block;
mod pinned;
pub use atomic::*;
pub use block::*;
pub use pinned::*;
