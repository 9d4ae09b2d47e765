//! Making arbitrary ranges of frames available or unavailable.
//!
//! Ranges need not be aligned or sized to a power of two. Each range is
//! broken into the largest aligned blocks that tile it, and each block is
//! handled on its own. A block whose frames are only partly in the requested
//! state is handled by recursing into its halves.

use log::debug;

use crate::{
    buddy::BuddyPageAllocator,
    order::{blocks_in_range, pages_in_block},
    PageAllocError, Pfn,
};

impl<const LEVELS: usize> BuddyPageAllocator<'_, LEVELS> {
    fn check_range(&self, start: Pfn, count: usize) -> Result<(), PageAllocError> {
        if !self.descriptors().contains_range(start, count) {
            return Err(PageAllocError::OutOfRange { pfn: start, count });
        }

        Ok(())
    }

    /// Makes `count` frames starting at `start` available for allocation.
    ///
    /// Frames in the range which are already free are left alone, so
    /// inserting the same range twice has no further effect. Newly freed
    /// frames are coalesced with free buddies.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range is not covered by the descriptor table.
    pub fn try_insert_page_range(
        &mut self,
        start: Pfn,
        count: usize,
    ) -> Result<(), PageAllocError> {
        self.check_range(start, count)?;

        let mut inserted = 0;
        for (head, order) in blocks_in_range(start, count, self.max_order()) {
            inserted += self.insert_block(head, order)?;
        }

        debug!("buddy: inserted {inserted} of {count} frames at {start}");

        Ok(())
    }

    /// Makes `count` frames starting at `start` available for allocation.
    ///
    /// # Panics
    ///
    /// Panics if the range is not covered by the descriptor table.
    pub fn insert_page_range(&mut self, start: Pfn, count: usize) {
        if let Err(e) = self.try_insert_page_range(start, count) {
            panic!("insert_page_range: {e}");
        }
    }

    /// Makes `count` frames starting at `start` unavailable for allocation.
    ///
    /// Only frames which are currently free are affected; allocated frames
    /// stay with their owners. Removing a range with no free frames does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range is not covered by the descriptor table.
    pub fn try_remove_page_range(
        &mut self,
        start: Pfn,
        count: usize,
    ) -> Result<(), PageAllocError> {
        self.check_range(start, count)?;

        let mut removed = 0;
        for (head, order) in blocks_in_range(start, count, self.max_order()) {
            removed += self.remove_block(head, order)?;
        }

        debug!("buddy: removed {removed} of {count} frames at {start}");

        Ok(())
    }

    /// Makes `count` frames starting at `start` unavailable for allocation.
    ///
    /// # Panics
    ///
    /// Panics if the range is not covered by the descriptor table.
    pub fn remove_page_range(&mut self, start: Pfn, count: usize) {
        if let Err(e) = self.try_remove_page_range(start, count) {
            panic!("remove_page_range: {e}");
        }
    }

    /// Frees whichever frames of the block at `head` are not already free.
    ///
    /// Returns the number of frames freed.
    fn insert_block(&mut self, head: Pfn, order: usize) -> Result<usize, PageAllocError> {
        let pages = pages_in_block(order);

        match self.free_pages_in(head, pages) {
            0 => {
                self.free_block(head, order)?;
                Ok(pages)
            }

            free if free == pages => Ok(0),

            // Partly free, so the block has at least two frames.
            _ => {
                let lower = order - 1;
                let upper_half = head + pages_in_block(lower);

                Ok(self.insert_block(head, lower)? + self.insert_block(upper_half, lower)?)
            }
        }
    }

    /// Removes whichever frames of the block at `head` are free.
    ///
    /// Returns the number of frames removed.
    fn remove_block(&mut self, head: Pfn, order: usize) -> Result<usize, PageAllocError> {
        let pages = pages_in_block(order);

        if self.free_pages_in(head, pages) == 0 {
            return Ok(0);
        }

        if let Some((block, block_order)) = self.free_block_covering(head, order) {
            self.isolate(head, order, block, block_order)?;
            self.unlink_block(head, order)?;
            return Ok(pages);
        }

        // Some frame is free but no free block covers the whole of this one.
        // A free order-0 block always covers itself, so `order` is nonzero.
        debug_assert!(order > 0);

        let lower = order - 1;
        let upper_half = head + pages_in_block(lower);

        Ok(self.remove_block(head, lower)? + self.remove_block(upper_half, lower)?)
    }

    /// Splits the free block at `block` until the block at `target` is free
    /// on its own at `order`.
    fn isolate(
        &mut self,
        target: Pfn,
        order: usize,
        block: Pfn,
        block_order: usize,
    ) -> Result<(), PageAllocError> {
        let mut block = block;
        let mut block_order = block_order;

        while block_order > order {
            let lower_half = self.split_block(block, block_order)?;
            block_order -= 1;

            let upper_half = lower_half + pages_in_block(block_order);
            block = if target >= upper_half {
                upper_half
            } else {
                lower_half
            };
        }

        debug_assert_eq!(block, target);

        Ok(())
    }
}
