//! A binary-buddy page allocator.

use core::fmt;

use log::{debug, trace};

use crate::{
    descriptor::{PageDescriptor, PageDescriptors},
    free_area::FreeAreaTable,
    order::{self, blocks_in_range, is_aligned, pages_in_block},
    InitError, PageAllocError, PageAllocatorAlgorithm, Pfn, ORDER_COUNT,
};

/// A binary-buddy page allocator.
///
/// This takes one const parameter, `LEVELS`, the number of free lists. The
/// allocator hands out blocks of order `0` through `LEVELS - 1`; by default
/// that is [`MAX_ORDER`](crate::MAX_ORDER).
///
/// `LEVELS` must be nonzero and no greater than `usize::BITS`. Attempting to
/// construct a `BuddyPageAllocator` which violates these invariants will
/// result in a panic.
///
/// The allocator borrows the descriptor array for its whole lifetime and
/// stores its free lists in it; it never allocates memory of its own.
///
/// # Example
///
/// ```
/// use page_buddy::{BuddyPageAllocator, PageDescriptor, Pfn};
///
/// let mut descriptors: Vec<PageDescriptor> =
///     (0..64).map(|i| PageDescriptor::new(Pfn(i))).collect();
///
/// // Blocks of up to 2^4 pages.
/// let mut pages: BuddyPageAllocator<'_, 5> = BuddyPageAllocator::new(&mut descriptors).unwrap();
/// pages.init(Pfn(0), 64).unwrap();
///
/// assert_eq!(pages.allocate_pages(4), Some(Pfn(0)));
/// assert_eq!(pages.allocate_pages(5), None);
/// ```
#[derive(Debug)]
pub struct BuddyPageAllocator<'a, const LEVELS: usize = ORDER_COUNT> {
    descriptors: PageDescriptors<'a>,
    free_areas: FreeAreaTable<LEVELS>,
    initialized: bool,
}

impl<'a, const LEVELS: usize> BuddyPageAllocator<'a, LEVELS> {
    /// The name of the algorithm.
    pub const NAME: &'static str = "buddy";

    fn assert_const_param_invariants() {
        assert!(LEVELS > 0, "buddy allocator must have at least one order");
        assert!(
            LEVELS <= usize::BITS as usize,
            "buddy allocator cannot have more orders than bits in a usize"
        );
    }

    /// Constructs an allocator over a descriptor array.
    ///
    /// The allocator starts out with no free pages; call [`init`] to make
    /// the described frames available.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the descriptors do not describe consecutive frames.
    ///
    /// [`init`]: Self::init
    pub fn new(
        descriptors: &'a mut [PageDescriptor],
    ) -> Result<BuddyPageAllocator<'a, LEVELS>, InitError> {
        PageDescriptors::new(descriptors).map(Self::with_descriptors)
    }

    /// Constructs an allocator over a descriptor table.
    pub fn with_descriptors(descriptors: PageDescriptors<'a>) -> BuddyPageAllocator<'a, LEVELS> {
        Self::assert_const_param_invariants();

        BuddyPageAllocator {
            descriptors,
            free_areas: FreeAreaTable::new(),
            initialized: false,
        }
    }

    /// Returns the name of the algorithm.
    #[inline]
    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Returns the largest order this allocator can hand out.
    #[inline]
    pub const fn max_order(&self) -> usize {
        LEVELS - 1
    }

    /// Returns the descriptor table backing this allocator.
    #[inline]
    pub fn descriptors(&self) -> &PageDescriptors<'a> {
        &self.descriptors
    }

    /// Makes `count` frames starting at `start` available for allocation.
    ///
    /// The frames are tiled with the largest aligned blocks that fit, which
    /// become the initial contents of the free lists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the frames lacks a descriptor, or if the
    /// allocator already has free pages.
    pub fn init(&mut self, start: Pfn, count: usize) -> Result<(), InitError> {
        if self.initialized || !self.free_areas.all_empty() {
            return Err(InitError::AlreadyInitialized);
        }

        if !self.descriptors.contains_range(start, count) {
            return Err(InitError::OutOfRange { start, count });
        }

        let max_order = self.max_order();
        let linked = self.free_areas.extend_sorted(
            &mut self.descriptors,
            blocks_in_range(start, count, max_order),
        );

        if linked != count {
            return Err(InitError::Residual(count - linked));
        }

        self.initialized = true;
        debug!("buddy: initialized {count} frames at {start}");

        Ok(())
    }

    /// Checks that `head` may name a block of the given order owned by this
    /// allocator.
    fn check_block(&self, head: Pfn, order: usize) -> Result<(), PageAllocError> {
        if order > self.max_order() {
            return Err(PageAllocError::OrderTooLarge { order });
        }

        if !is_aligned(head, order) {
            return Err(PageAllocError::Misaligned { pfn: head, order });
        }

        let count = pages_in_block(order);
        if !self.descriptors.contains_range(head, count) {
            return Err(PageAllocError::OutOfRange { pfn: head, count });
        }

        Ok(())
    }

    /// Returns the head of the buddy of the order-`order` block at `head`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `head` is not aligned to `order` or if `order` is the
    /// maximum order.
    #[inline]
    pub fn buddy_of(&self, head: Pfn, order: usize) -> Result<Pfn, PageAllocError> {
        order::buddy_of(head, order, self.max_order())
    }

    /// Splits a free block into two free blocks of the order below.
    ///
    /// Returns the lower half. Splitting an order-0 block does nothing.
    ///
    /// The halves are buddies and are left unmerged; this is a building block
    /// for allocation and range removal.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `head` is not aligned to `order` or if the block is
    /// not free at that order.
    pub fn split_block(&mut self, head: Pfn, order: usize) -> Result<Pfn, PageAllocError> {
        if order > self.max_order() {
            return Err(PageAllocError::OrderTooLarge { order });
        }

        if !is_aligned(head, order) {
            return Err(PageAllocError::Misaligned { pfn: head, order });
        }

        if order == 0 {
            return Ok(head);
        }

        self.free_areas.remove(&mut self.descriptors, head, order)?;

        let lower = order - 1;
        let upper_half = head + pages_in_block(lower);

        self.free_areas
            .insert(&mut self.descriptors, head, lower)?;
        self.free_areas
            .insert(&mut self.descriptors, upper_half, lower)?;

        trace!("buddy: split order {order} block at {head}");

        Ok(head)
    }

    /// Merges a free block with its buddy into a free block of the order
    /// above.
    ///
    /// Returns the head of the merged block. Merging a block of the maximum
    /// order does nothing.
    ///
    /// The caller is responsible for checking that the buddy is free; this
    /// only fails if it turns out not to be on the free list.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `head` is not aligned to `order`, or if either the
    /// block or its buddy is not free at that order. The free lists are left
    /// unchanged on error.
    pub fn merge_block(&mut self, head: Pfn, order: usize) -> Result<Pfn, PageAllocError> {
        if order > self.max_order() {
            return Err(PageAllocError::OrderTooLarge { order });
        }

        if !is_aligned(head, order) {
            return Err(PageAllocError::Misaligned { pfn: head, order });
        }

        if order == self.max_order() {
            return Ok(head);
        }

        let buddy = self.buddy_of(head, order)?;

        self.free_areas.remove(&mut self.descriptors, head, order)?;

        if let Err(e) = self.free_areas.remove(&mut self.descriptors, buddy, order) {
            // Put `head` back before reporting the missing buddy.
            self.free_areas
                .insert(&mut self.descriptors, head, order)
                .expect("block vanished from free list");
            return Err(e);
        }

        let merged = head.min(buddy);
        self.free_areas
            .insert(&mut self.descriptors, merged, order + 1)?;

        trace!("buddy: merged order {order} blocks at {head} and {buddy}");

        Ok(merged)
    }

    /// Allocates `2^order` contiguous frames.
    ///
    /// The lowest free block of the smallest sufficient order is split down
    /// to the requested order, keeping the lower half at each step.
    ///
    /// Returns the first frame of the block, or `None` if no sufficiently
    /// large block is free (or `order` exceeds the maximum order).
    pub fn allocate_pages(&mut self, order: usize) -> Option<Pfn> {
        if order > self.max_order() {
            return None;
        }

        let found = (order..LEVELS).find(|&o| !self.free_areas.is_empty(o))?;
        let mut block = self.free_areas.head(found)?;

        for level in (order + 1..=found).rev() {
            block = self
                .split_block(block, level)
                .expect("free list head failed to split");
        }

        self.free_areas
            .remove(&mut self.descriptors, block, order)
            .expect("split block missing from free list");

        trace!("buddy: allocated order {order} block at {block}");

        Some(block)
    }

    /// Frees `2^order` contiguous frames starting at `head`, coalescing them
    /// with free buddies.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `head` is not aligned to `order`, if `order` exceeds
    /// the maximum order, if the block is not covered by the descriptor
    /// table, or if any frame of the block is already free. The free lists
    /// are left untouched on error.
    pub fn try_free_pages(&mut self, head: Pfn, order: usize) -> Result<(), PageAllocError> {
        self.check_block(head, order)?;

        if self.free_pages_in(head, pages_in_block(order)) != 0 {
            return Err(PageAllocError::DoubleFree { pfn: head, order });
        }

        self.free_block(head, order)?;

        trace!("buddy: freed order {order} block at {head}");

        Ok(())
    }

    /// Frees `2^order` contiguous frames starting at `head`, coalescing them
    /// with free buddies.
    ///
    /// # Panics
    ///
    /// Panics if `head` is not aligned to `order`, if `order` exceeds the
    /// maximum order, if the block is not covered by the descriptor table,
    /// or if any frame of the block is already free.
    pub fn free_pages(&mut self, head: Pfn, order: usize) {
        if let Err(e) = self.try_free_pages(head, order) {
            panic!("free_pages: {e}");
        }
    }

    /// Inserts a block into the free lists and coalesces it upward for as
    /// long as its buddy is free.
    ///
    /// Returns the head of the final merged block.
    pub(crate) fn free_block(&mut self, head: Pfn, order: usize) -> Result<Pfn, PageAllocError> {
        self.free_areas.insert(&mut self.descriptors, head, order)?;

        let mut head = head;
        let mut order = order;

        while order < self.max_order() {
            let buddy = self.buddy_of(head, order)?;

            if !self.free_areas.contains(&self.descriptors, buddy, order) {
                break;
            }

            head = self.merge_block(head, order)?;
            order += 1;
        }

        Ok(head)
    }

    /// Removes a free block from the free list of its order.
    #[inline]
    pub(crate) fn unlink_block(&mut self, head: Pfn, order: usize) -> Result<(), PageAllocError> {
        self.free_areas.remove(&mut self.descriptors, head, order)
    }

    /// Returns the free block of order `min_order` or above that covers
    /// `pfn`, as a `(head, order)` pair.
    pub(crate) fn free_block_covering(&self, pfn: Pfn, min_order: usize) -> Option<(Pfn, usize)> {
        (min_order..LEVELS).find_map(|order| {
            self.free_areas
                .covering(&self.descriptors, pfn, order)
                .map(|head| (head, order))
        })
    }

    /// Returns the number of free frames among the `count` frames starting at
    /// `start`.
    pub(crate) fn free_pages_in(&self, start: Pfn, count: usize) -> usize {
        let end = start.get().saturating_add(count);

        (0..LEVELS)
            .map(|order| {
                let pages = pages_in_block(order);

                self.free_areas
                    .iter(&self.descriptors, order)
                    .take_while(|head| head.get() < end)
                    .map(|head| {
                        let lo = head.get().max(start.get());
                        let hi = (head.get() + pages).min(end);
                        hi.saturating_sub(lo)
                    })
                    .sum::<usize>()
            })
            .sum()
    }

    /// Returns `true` if frame `pfn` is part of a free block.
    pub fn is_free(&self, pfn: Pfn) -> bool {
        self.free_block_covering(pfn, 0).is_some()
    }

    /// Returns the total number of free frames.
    pub fn free_page_count(&self) -> usize {
        (0..LEVELS)
            .map(|order| self.free_areas.len(&self.descriptors, order) * pages_in_block(order))
            .sum()
    }

    /// Returns an iterator over all free blocks as `(head, order)` pairs.
    ///
    /// Blocks are yielded order by order, from order 0 upward, and in
    /// ascending order of address within each order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (Pfn, usize)> + '_ {
        (0..LEVELS).flat_map(move |order| {
            self.free_areas
                .iter(&self.descriptors, order)
                .map(move |head| (head, order))
        })
    }

    /// Returns a displayable listing of the free blocks of every order.
    pub fn state(&self) -> FreeAreaState<'_, 'a, LEVELS> {
        FreeAreaState { allocator: self }
    }

    /// Logs the free blocks of every order at debug level.
    pub fn dump_state(&self) {
        debug!("BUDDY STATE:");

        for order in 0..LEVELS {
            debug!(
                "{}",
                FreeListLine {
                    allocator: self,
                    order
                }
            );
        }
    }
}

impl<const LEVELS: usize> PageAllocatorAlgorithm for BuddyPageAllocator<'_, LEVELS> {
    fn name(&self) -> &'static str {
        BuddyPageAllocator::name(self)
    }

    fn init(&mut self, start: Pfn, count: usize) -> Result<(), InitError> {
        BuddyPageAllocator::init(self, start, count)
    }

    fn allocate_pages(&mut self, order: usize) -> Option<Pfn> {
        BuddyPageAllocator::allocate_pages(self, order)
    }

    fn free_pages(&mut self, head: Pfn, order: usize) {
        BuddyPageAllocator::free_pages(self, head, order)
    }

    fn insert_page_range(&mut self, start: Pfn, count: usize) {
        BuddyPageAllocator::insert_page_range(self, start, count)
    }

    fn remove_page_range(&mut self, start: Pfn, count: usize) {
        BuddyPageAllocator::remove_page_range(self, start, count)
    }

    fn dump_state(&self) {
        BuddyPageAllocator::dump_state(self)
    }
}

/// A listing of the free blocks of every order.
///
/// Each line has the form `[order] pfn pfn ...`, with frame numbers in
/// hexadecimal.
///
/// Created by [`BuddyPageAllocator::state`].
pub struct FreeAreaState<'s, 'a, const LEVELS: usize> {
    allocator: &'s BuddyPageAllocator<'a, LEVELS>,
}

impl<const LEVELS: usize> fmt::Display for FreeAreaState<'_, '_, LEVELS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for order in 0..LEVELS {
            writeln!(
                f,
                "{}",
                FreeListLine {
                    allocator: self.allocator,
                    order,
                }
            )?;
        }

        Ok(())
    }
}

impl<const LEVELS: usize> fmt::Debug for FreeAreaState<'_, '_, LEVELS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.allocator.free_blocks()).finish()
    }
}

struct FreeListLine<'s, 'a, const LEVELS: usize> {
    allocator: &'s BuddyPageAllocator<'a, LEVELS>,
    order: usize,
}

impl<const LEVELS: usize> fmt::Display for FreeListLine<'_, '_, LEVELS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.order)?;

        let alloc = self.allocator;
        for head in alloc.free_areas.iter(&alloc.descriptors, self.order) {
            write!(f, " {head:x}")?;
        }

        Ok(())
    }
}
