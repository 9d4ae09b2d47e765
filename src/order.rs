//! Block geometry.
//!
//! A block of order `k` spans `2^k` frames and starts at a frame number that
//! is a multiple of `2^k`. Everything in this module is plain frame-number
//! arithmetic; none of it touches allocator state.

use crate::{PageAllocError, Pfn};

/// Returns the number of frames in a block of the given order.
#[inline]
pub const fn pages_in_block(order: usize) -> usize {
    1 << order
}

/// Returns `true` if `pfn` may be the head of a block of the given order.
#[inline]
pub const fn is_aligned(pfn: Pfn, order: usize) -> bool {
    pfn.get() & (pages_in_block(order) - 1) == 0
}

/// Returns the head of the buddy of the order-`order` block at `pfn`.
///
/// If `pfn` is aligned to `order + 1`, the buddy is the block that follows
/// it; otherwise it is the block that precedes it.
///
/// # Errors
///
/// Returns `Err` if `pfn` is not aligned to `order`, or if `order` is the
/// maximum order (such blocks have no parent, and therefore no buddy).
pub fn buddy_of(pfn: Pfn, order: usize, max_order: usize) -> Result<Pfn, PageAllocError> {
    if order >= max_order {
        return Err(PageAllocError::NoBuddyAtMaxOrder { pfn });
    }

    if !is_aligned(pfn, order) {
        return Err(PageAllocError::Misaligned { pfn, order });
    }

    // The two buddies differ only in the bit selecting the half of the parent.
    Ok(Pfn(pfn.get() ^ pages_in_block(order)))
}

/// Returns the largest order whose blocks may start at `pfn`.
///
/// Frame zero is aligned to every order.
#[inline]
pub fn alignment_order(pfn: Pfn) -> usize {
    pfn.get().trailing_zeros() as usize
}

/// Returns an iterator over the maximal aligned blocks tiling `count`
/// frames starting at `start`.
///
/// Blocks are yielded as `(head, order)` pairs in ascending order of
/// address. No block exceeds `max_order`.
pub fn blocks_in_range(start: Pfn, count: usize, max_order: usize) -> BlocksInRange {
    BlocksInRange {
        cursor: start,
        remaining: count,
        max_order,
    }
}

/// An iterator over the maximal aligned blocks in a range of frames.
///
/// Created by [`blocks_in_range`].
#[derive(Clone, Debug)]
pub struct BlocksInRange {
    cursor: Pfn,
    remaining: usize,
    max_order: usize,
}

impl Iterator for BlocksInRange {
    type Item = (Pfn, usize);

    fn next(&mut self) -> Option<(Pfn, usize)> {
        if self.remaining == 0 {
            return None;
        }

        let fits = self.remaining.ilog2() as usize;
        let order = alignment_order(self.cursor).min(fits).min(self.max_order);
        let pages = pages_in_block(order);

        let head = self.cursor;
        self.cursor = Pfn(self.cursor.get().wrapping_add(pages));
        self.remaining -= pages;

        Some((head, order))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    #[test]
    fn block_sizes() {
        assert_eq!(pages_in_block(0), 1);
        assert_eq!(pages_in_block(3), 8);
        assert_eq!(pages_in_block(18), 262_144);
    }

    #[test]
    fn alignment() {
        assert!(is_aligned(Pfn(0), 18));
        assert!(is_aligned(Pfn(8), 3));
        assert!(!is_aligned(Pfn(8), 4));
        assert!(is_aligned(Pfn(7), 0));
        assert_eq!(alignment_order(Pfn(12)), 2);
    }

    #[test]
    fn buddy_follows_when_aligned_to_parent() {
        assert_eq!(buddy_of(Pfn(0), 0, 18), Ok(Pfn(1)));
        assert_eq!(buddy_of(Pfn(16), 3, 18), Ok(Pfn(24)));
    }

    #[test]
    fn buddy_precedes_when_not_aligned_to_parent() {
        assert_eq!(buddy_of(Pfn(1), 0, 18), Ok(Pfn(0)));
        assert_eq!(buddy_of(Pfn(24), 3, 18), Ok(Pfn(16)));
    }

    #[test]
    fn buddy_requires_alignment() {
        assert_eq!(
            buddy_of(Pfn(4), 3, 18),
            Err(PageAllocError::Misaligned {
                pfn: Pfn(4),
                order: 3
            })
        );
    }

    #[test]
    fn no_buddy_at_max_order() {
        assert_eq!(
            buddy_of(Pfn(0), 18, 18),
            Err(PageAllocError::NoBuddyAtMaxOrder { pfn: Pfn(0) })
        );
    }

    #[test]
    fn aligned_power_of_two_range_is_one_block() {
        let blocks: Vec<_> = blocks_in_range(Pfn(0), 1024, 18).collect();
        assert_eq!(blocks, [(Pfn(0), 10)]);
    }

    #[test]
    fn range_is_tiled_greedily() {
        let blocks: Vec<_> = blocks_in_range(Pfn(0), 13, 18).collect();
        assert_eq!(blocks, [(Pfn(0), 3), (Pfn(8), 2), (Pfn(12), 0)]);
    }

    #[test]
    fn unaligned_start_yields_aligned_blocks() {
        let blocks: Vec<_> = blocks_in_range(Pfn(3), 14, 18).collect();
        assert_eq!(
            blocks,
            [(Pfn(3), 0), (Pfn(4), 2), (Pfn(8), 3), (Pfn(16), 0)]
        );
    }

    #[test]
    fn range_respects_max_order() {
        let blocks: Vec<_> = blocks_in_range(Pfn(0), 20, 2).collect();
        assert_eq!(
            blocks,
            [
                (Pfn(0), 2),
                (Pfn(4), 2),
                (Pfn(8), 2),
                (Pfn(12), 2),
                (Pfn(16), 2)
            ]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        assert_eq!(blocks_in_range(Pfn(5), 0, 18).count(), 0);
    }

    #[test]
    fn ranges_tile_exactly() {
        for start in 0..40 {
            for count in 0..70 {
                let mut cursor = start;
                for (head, order) in blocks_in_range(Pfn(start), count, 4) {
                    assert_eq!(head, Pfn(cursor));
                    assert!(is_aligned(head, order));
                    cursor += pages_in_block(order);
                }
                assert_eq!(cursor, start + count);
            }
        }
    }
}
