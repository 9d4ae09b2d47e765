//! A binary-buddy physical page allocator.
//!
//! [`BuddyPageAllocator`] hands out runs of `2^order` physical pages, where
//! pages are identified by their physical frame number ([`Pfn`]). The
//! allocator keeps no auxiliary heap: every free block is tracked by an
//! intrusive link stored in the [`PageDescriptor`] of the block's first page,
//! and the descriptors themselves live in an array supplied by the caller.
//!
//! ```
//! use page_buddy::{BuddyPageAllocator, PageDescriptor, Pfn};
//!
//! let mut descriptors: Vec<PageDescriptor> =
//!     (0..1024).map(|i| PageDescriptor::new(Pfn(i))).collect();
//!
//! let mut pages: BuddyPageAllocator<'_> = BuddyPageAllocator::new(&mut descriptors).unwrap();
//! pages.init(Pfn(0), 1024).unwrap();
//!
//! let block = pages.allocate_pages(3).unwrap();
//! assert_eq!(block, Pfn(0));
//! pages.free_pages(block, 3);
//! assert_eq!(pages.free_page_count(), 1024);
//! ```

#![doc(html_root_url = "https://docs.rs/page_buddy/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

pub mod buddy;
mod descriptor;
pub mod frame;
mod free_area;
mod locked;
pub mod order;
mod range;

#[cfg(feature = "sptr")]
mod polyfill;


use core::{fmt, ops::Add};

pub use crate::{
    buddy::{BuddyPageAllocator, FreeAreaState},
    descriptor::{PageDescriptor, PageDescriptors},
    frame::FrameRegion,
    locked::LockedPageAllocator,
};

#[cfg(feature = "alloc")]
pub use crate::descriptor::descriptor_array;

/// The largest order a default-configured allocator can hand out.
///
/// Blocks of this order span `2^18` pages.
pub const MAX_ORDER: usize = 18;

/// The number of free lists in a default-configured allocator.
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// A physical frame number.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Pfn(pub usize);

impl Pfn {
    /// Returns the frame number as a `usize`.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the frame `pages` frames after `self`, or `None` on overflow.
    #[inline]
    pub fn checked_add(self, pages: usize) -> Option<Pfn> {
        self.0.checked_add(pages).map(Pfn)
    }

    /// Returns the number of frames from `origin` to `self`, or `None` if
    /// `self` precedes `origin`.
    #[inline]
    pub fn offset_from(self, origin: Pfn) -> Option<usize> {
        self.0.checked_sub(origin.0)
    }
}

impl Add<usize> for Pfn {
    type Output = Pfn;

    #[inline]
    fn add(self, pages: usize) -> Pfn {
        Pfn(self.0 + pages)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// The error type for allocator constructors and [`init`].
///
/// [`init`]: BuddyPageAllocator::init
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// The descriptor array does not describe consecutive frames.
    ///
    /// The descriptor at `index` was expected to describe frame `expected`.
    NonContiguous {
        /// Index into the descriptor array.
        index: usize,
        /// The frame number implied by the first descriptor.
        expected: Pfn,
        /// The frame number actually found.
        found: Pfn,
    },

    /// The requested range is not covered by the descriptor array.
    OutOfRange {
        /// First frame of the range.
        start: Pfn,
        /// Number of frames in the range.
        count: usize,
    },

    /// The allocator has already been initialized.
    AlreadyInitialized,

    /// Initialization could not tile the range exactly.
    ///
    /// This indicates a bug in the allocator.
    Residual(usize),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NonContiguous {
                index,
                expected,
                found,
            } => write!(
                f,
                "descriptor {index} describes frame {found}, expected {expected}"
            ),
            InitError::OutOfRange { start, count } => write!(
                f,
                "range of {count} frames at {start} exceeds the descriptor array"
            ),
            InitError::AlreadyInitialized => f.write_str("allocator already initialized"),
            InitError::Residual(n) => write!(f, "{n} frames left untiled"),
        }
    }
}

/// Indicates a violation of the allocator's calling contract.
///
/// These errors signal a bug in the caller. The non-`try_` operations panic
/// when they occur.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageAllocError {
    /// The order exceeds the allocator's maximum order.
    OrderTooLarge {
        /// The offending order.
        order: usize,
    },

    /// The block head is not aligned to its order.
    Misaligned {
        /// The block head.
        pfn: Pfn,
        /// The block order.
        order: usize,
    },

    /// A buddy was requested at the maximum order, which has no parent.
    NoBuddyAtMaxOrder {
        /// The block head.
        pfn: Pfn,
    },

    /// The frames are not covered by the descriptor array.
    OutOfRange {
        /// First frame of the range.
        pfn: Pfn,
        /// Number of frames in the range.
        count: usize,
    },

    /// The block is not on the free list of its claimed order.
    NotFound {
        /// The block head.
        pfn: Pfn,
        /// The block order.
        order: usize,
    },

    /// The block is already on the free list of its order.
    AlreadyFree {
        /// The block head.
        pfn: Pfn,
        /// The block order.
        order: usize,
    },

    /// Some frame of a block being freed is already free.
    DoubleFree {
        /// The block head.
        pfn: Pfn,
        /// The block order.
        order: usize,
    },
}

impl fmt::Display for PageAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageAllocError::OrderTooLarge { order } => {
                write!(f, "order {order} exceeds the maximum order")
            }
            PageAllocError::Misaligned { pfn, order } => {
                write!(f, "block at {pfn} is not aligned to order {order}")
            }
            PageAllocError::NoBuddyAtMaxOrder { pfn } => {
                write!(f, "block at {pfn} has no buddy at the maximum order")
            }
            PageAllocError::OutOfRange { pfn, count } => {
                write!(f, "{count} frames at {pfn} exceed the descriptor array")
            }
            PageAllocError::NotFound { pfn, order } => {
                write!(f, "block at {pfn} missing from order {order} free list")
            }
            PageAllocError::AlreadyFree { pfn, order } => {
                write!(f, "block at {pfn} already on order {order} free list")
            }
            PageAllocError::DoubleFree { pfn, order } => {
                write!(f, "double free of order {order} block at {pfn}")
            }
        }
    }
}

/// A page allocation algorithm.
///
/// This is the interface a kernel's memory manager drives; any implementor
/// can be shared between processors by wrapping it in a
/// [`LockedPageAllocator`].
pub trait PageAllocatorAlgorithm {
    /// Returns the name of the algorithm, for debugging and selection.
    fn name(&self) -> &'static str;

    /// Makes `count` frames starting at `start` available for allocation.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the frames are not covered by the descriptor array
    /// or if the allocator was already initialized.
    fn init(&mut self, start: Pfn, count: usize) -> Result<(), InitError>;

    /// Allocates `2^order` contiguous frames, returning the first.
    ///
    /// Returns `None` if no sufficiently large block is free.
    fn allocate_pages(&mut self, order: usize) -> Option<Pfn>;

    /// Frees the `2^order` contiguous frames starting at `head`.
    fn free_pages(&mut self, head: Pfn, order: usize);

    /// Marks `count` frames starting at `start` as available.
    fn insert_page_range(&mut self, start: Pfn, count: usize);

    /// Marks `count` frames starting at `start` as unavailable.
    fn remove_page_range(&mut self, start: Pfn, count: usize);

    /// Logs the current state of the allocator.
    fn dump_state(&self);
}
