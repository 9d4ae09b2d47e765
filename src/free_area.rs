use crate::{
    descriptor::PageDescriptors,
    order::{is_aligned, pages_in_block},
    PageAllocError, Pfn,
};

/// The free lists of a buddy allocator, one per order.
///
/// Each list is singly linked through the descriptors of the free blocks'
/// head frames and kept in ascending order of frame number.
#[derive(Debug)]
pub(crate) struct FreeAreaTable<const LEVELS: usize> {
    heads: [Option<Pfn>; LEVELS],
}

impl<const LEVELS: usize> FreeAreaTable<LEVELS> {
    pub(crate) const fn new() -> FreeAreaTable<LEVELS> {
        FreeAreaTable {
            heads: [None; LEVELS],
        }
    }

    /// Returns the lowest free block of the given order.
    #[inline]
    pub(crate) fn head(&self, order: usize) -> Option<Pfn> {
        self.heads[order]
    }

    #[inline]
    pub(crate) fn is_empty(&self, order: usize) -> bool {
        self.heads[order].is_none()
    }

    /// Returns the number of free blocks of the given order.
    pub(crate) fn len(&self, descriptors: &PageDescriptors<'_>, order: usize) -> usize {
        self.iter(descriptors, order).count()
    }

    /// Returns `true` if no order has a free block.
    pub(crate) fn all_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    /// Returns an iterator over the free blocks of the given order.
    pub(crate) fn iter<'d>(
        &self,
        descriptors: &'d PageDescriptors<'_>,
        order: usize,
    ) -> FreeList<'d> {
        FreeList {
            descriptors,
            cursor: self.heads[order],
        }
    }

    /// Inserts a block into the free list of the given order.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the block is already on the list.
    pub(crate) fn insert(
        &mut self,
        descriptors: &mut PageDescriptors<'_>,
        block: Pfn,
        order: usize,
    ) -> Result<(), PageAllocError> {
        debug_assert!(is_aligned(block, order));

        let mut prev = None;
        let mut cur = self.heads[order];

        while let Some(c) = cur {
            if c >= block {
                break;
            }

            prev = Some(c);
            cur = descriptors.next(c);
        }

        if cur == Some(block) {
            return Err(PageAllocError::AlreadyFree { pfn: block, order });
        }

        // `block` points forward to the first block above it.
        descriptors.set_next(block, cur);

        match prev {
            Some(p) => descriptors.set_next(p, Some(block)),
            None => self.heads[order] = Some(block),
        }

        Ok(())
    }

    /// Removes a block from the free list of the given order.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the block is not on the list.
    pub(crate) fn remove(
        &mut self,
        descriptors: &mut PageDescriptors<'_>,
        block: Pfn,
        order: usize,
    ) -> Result<(), PageAllocError> {
        let mut prev = None;
        let mut cur = self.heads[order];

        while let Some(c) = cur {
            if c == block {
                let next = descriptors.next(c);

                match prev {
                    // Link `prev` forward to `next`.
                    Some(p) => descriptors.set_next(p, next),

                    // If there's no previous block, then `block` is the head
                    // of the list.
                    None => self.heads[order] = next,
                }

                descriptors.set_next(c, None);
                return Ok(());
            }

            // The list is sorted, so the block can't appear further on.
            if c > block {
                break;
            }

            prev = Some(c);
            cur = descriptors.next(c);
        }

        Err(PageAllocError::NotFound { pfn: block, order })
    }

    /// Returns the head of the free block of the given order that covers
    /// `pfn`, if there is one.
    pub(crate) fn covering(
        &self,
        descriptors: &PageDescriptors<'_>,
        pfn: Pfn,
        order: usize,
    ) -> Option<Pfn> {
        let pages = pages_in_block(order);

        self.iter(descriptors, order)
            .take_while(|&head| head <= pfn)
            .find(|&head| pfn.get() - head.get() < pages)
    }

    /// Returns `true` if a free block of the given order covers `pfn`.
    #[inline]
    pub(crate) fn contains(
        &self,
        descriptors: &PageDescriptors<'_>,
        pfn: Pfn,
        order: usize,
    ) -> bool {
        self.covering(descriptors, pfn, order).is_some()
    }

    /// Links a run of blocks into empty free lists.
    ///
    /// The blocks must be in ascending order of address and must not overlap.
    /// Rather than searching each list for an insertion point, every block is
    /// appended to the tail of its list.
    ///
    /// Returns the number of frames linked.
    pub(crate) fn extend_sorted<I>(
        &mut self,
        descriptors: &mut PageDescriptors<'_>,
        blocks: I,
    ) -> usize
    where
        I: IntoIterator<Item = (Pfn, usize)>,
    {
        debug_assert!(self.all_empty());

        let mut tails = [None::<Pfn>; LEVELS];
        let mut linked = 0;

        for (block, order) in blocks {
            debug_assert!(is_aligned(block, order));

            descriptors.set_next(block, None);

            match tails[order] {
                Some(tail) => {
                    debug_assert!(tail < block);
                    descriptors.set_next(tail, Some(block));
                }
                None => self.heads[order] = Some(block),
            }

            tails[order] = Some(block);
            linked += pages_in_block(order);
        }

        linked
    }
}

/// An iterator over the heads of the free blocks of one order.
pub(crate) struct FreeList<'d> {
    descriptors: &'d PageDescriptors<'d>,
    cursor: Option<Pfn>,
}

impl Iterator for FreeList<'_> {
    type Item = Pfn;

    fn next(&mut self) -> Option<Pfn> {
        let cur = self.cursor?;
        self.cursor = self.descriptors.next(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::descriptor::descriptor_array;

    #[test]
    fn insert_keeps_address_order() {
        let mut descs = descriptor_array(Pfn(0), 64);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        for pfn in [24, 8, 40, 0] {
            free.insert(&mut table, Pfn(pfn), 3).unwrap();
        }

        let list: Vec<_> = free.iter(&table, 3).collect();
        assert_eq!(list, [Pfn(0), Pfn(8), Pfn(24), Pfn(40)]);
        assert_eq!(free.len(&table, 3), 4);
        assert_eq!(free.head(3), Some(Pfn(0)));
        assert!(free.is_empty(2));
    }

    #[test]
    fn insert_twice_fails() {
        let mut descs = descriptor_array(Pfn(0), 16);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        free.insert(&mut table, Pfn(4), 2).unwrap();
        assert_eq!(
            free.insert(&mut table, Pfn(4), 2),
            Err(PageAllocError::AlreadyFree {
                pfn: Pfn(4),
                order: 2
            })
        );
    }

    #[test]
    fn remove_unlinks_head_middle_and_tail() {
        let mut descs = descriptor_array(Pfn(0), 16);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        for pfn in 0..6 {
            free.insert(&mut table, Pfn(pfn), 0).unwrap();
        }

        free.remove(&mut table, Pfn(0), 0).unwrap();
        free.remove(&mut table, Pfn(3), 0).unwrap();
        free.remove(&mut table, Pfn(5), 0).unwrap();

        let list: Vec<_> = free.iter(&table, 0).collect();
        assert_eq!(list, [Pfn(1), Pfn(2), Pfn(4)]);
    }

    #[test]
    fn remove_missing_block_fails() {
        let mut descs = descriptor_array(Pfn(0), 16);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        free.insert(&mut table, Pfn(8), 3).unwrap();

        assert_eq!(
            free.remove(&mut table, Pfn(0), 3),
            Err(PageAllocError::NotFound {
                pfn: Pfn(0),
                order: 3
            })
        );
        assert_eq!(
            free.remove(&mut table, Pfn(8), 2),
            Err(PageAllocError::NotFound {
                pfn: Pfn(8),
                order: 2
            })
        );
        assert_eq!(free.head(3), Some(Pfn(8)));
    }

    #[test]
    fn covering_finds_enclosing_block() {
        let mut descs = descriptor_array(Pfn(0), 32);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        free.insert(&mut table, Pfn(16), 3).unwrap();

        assert_eq!(free.covering(&table, Pfn(16), 3), Some(Pfn(16)));
        assert_eq!(free.covering(&table, Pfn(23), 3), Some(Pfn(16)));
        assert_eq!(free.covering(&table, Pfn(24), 3), None);
        assert_eq!(free.covering(&table, Pfn(15), 3), None);
        assert!(free.contains(&table, Pfn(20), 3));
        assert!(!free.contains(&table, Pfn(20), 2));
    }

    #[test]
    fn extend_sorted_links_each_order_in_sequence() {
        let mut descs = descriptor_array(Pfn(0), 64);
        let mut table = PageDescriptors::new(&mut descs).unwrap();
        let mut free = FreeAreaTable::<4>::new();

        let linked = free.extend_sorted(
            &mut table,
            [(Pfn(0), 3), (Pfn(8), 3), (Pfn(16), 2), (Pfn(20), 0), (Pfn(24), 3)],
        );

        assert_eq!(linked, 8 + 8 + 4 + 1 + 8);

        let order_3: Vec<_> = free.iter(&table, 3).collect();
        assert_eq!(order_3, [Pfn(0), Pfn(8), Pfn(24)]);
        assert_eq!(free.head(2), Some(Pfn(16)));
        assert_eq!(free.head(0), Some(Pfn(20)));
        assert!(free.is_empty(1));
    }
}
