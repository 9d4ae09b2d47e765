use std::ptr::NonNull;

use page_buddy::{
    order::pages_in_block, BuddyPageAllocator, FrameRegion, InitError, PageDescriptor, Pfn,
    ORDER_COUNT,
};

use crate::Subject;

/// Range operations on a [`BuddySubject`].
#[derive(Clone, Debug, arbitrary::Arbitrary)]
pub enum BuddyOp {
    /// Make free frames in a range unavailable. Both fields are reduced to
    /// fit the pool.
    Reserve { start: usize, len: usize },
    /// Make a reserved run available again, chosen modulo the number of runs.
    Restore(usize),
}

/// A buddy allocator over a pool of frames backed by ordinary memory.
pub struct BuddySubject<'a, const LEVELS: usize = ORDER_COUNT> {
    allocator: BuddyPageAllocator<'a, LEVELS>,
    region: FrameRegion,
    total: usize,
    allocated: usize,
    // Runs of frames that were free when they were reserved.
    reserved: Vec<(Pfn, usize)>,
}

impl<'a, const LEVELS: usize> BuddySubject<'a, LEVELS> {
    /// Creates a subject managing every frame in `descriptors`, with frame
    /// contents stored in `memory`.
    ///
    /// # Panics
    ///
    /// Panics if `memory` is smaller than `page_size` bytes per descriptor.
    pub fn new(
        descriptors: &'a mut [PageDescriptor],
        memory: &'a mut [u8],
        page_size: usize,
    ) -> Result<Self, InitError> {
        let base = descriptors.first().map_or(Pfn(0), PageDescriptor::pfn);
        let total = descriptors.len();

        assert!(
            memory.len() >= total * page_size,
            "memory too small for {total} frames"
        );

        let region = FrameRegion::new(NonNull::from(memory).cast(), base, total, page_size);

        let mut allocator = BuddyPageAllocator::new(descriptors)?;
        allocator.init(base, total)?;

        Ok(BuddySubject {
            allocator,
            region,
            total,
            allocated: 0,
            reserved: Vec::new(),
        })
    }

    pub fn allocator(&self) -> &BuddyPageAllocator<'a, LEVELS> {
        &self.allocator
    }

    /// Makes the free frames among `len` frames at offset `start` into the
    /// pool unavailable.
    pub fn reserve(&mut self, start: usize, len: usize) {
        let n = self.total;
        if n == 0 {
            return;
        }

        let start = start % n;
        let len = len % (n - start + 1);
        let first = self.region.base() + start;

        let mut run: Option<(Pfn, usize)> = None;
        for pfn in (0..len).map(|i| first + i) {
            if self.allocator.is_free(pfn) {
                run = Some(match run {
                    Some((head, count)) => (head, count + 1),
                    None => (pfn, 1),
                });
            } else if let Some(r) = run.take() {
                self.reserved.push(r);
            }
        }
        self.reserved.extend(run);

        self.allocator.remove_page_range(first, len);
    }

    /// Makes a reserved run available again.
    pub fn restore(&mut self, index: usize) {
        if self.reserved.is_empty() {
            return;
        }

        let (head, count) = self.reserved.swap_remove(index % self.reserved.len());
        self.allocator.insert_page_range(head, count);
    }
}

impl<const LEVELS: usize> Subject for BuddySubject<'_, LEVELS> {
    type Op = BuddyOp;

    fn allocate_pages(&mut self, order: usize) -> Option<NonNull<[u8]>> {
        let head = self.allocator.allocate_pages(order)?;
        self.allocated += pages_in_block(order);

        self.region.block_of(head, order)
    }

    unsafe fn free_pages(&mut self, block: NonNull<[u8]>, order: usize) {
        let head = self
            .region
            .pfn_of(block.cast())
            .expect("block outside of region");

        self.allocator.free_pages(head, order);
        self.allocated -= pages_in_block(order);
    }

    fn handle_custom_op(&mut self, op: BuddyOp) {
        match op {
            BuddyOp::Reserve { start, len } => self.reserve(start, len),
            BuddyOp::Restore(index) => self.restore(index),
        }
    }

    fn is_consistent(&self) -> bool {
        let reserved: usize = self.reserved.iter().map(|&(_, count)| count).sum();

        self.allocator.free_page_count() + self.allocated + reserved == self.total
    }
}

#[cfg(test)]
mod tests {
    use arbitrary::{Arbitrary, Unstructured};
    use page_buddy::descriptor_array;

    use super::*;
    use crate::{AllocatorOp, Evaluator};

    const PAGE_SIZE: usize = 64;

    #[test]
    fn scripted_ops() {
        let mut descs = descriptor_array(Pfn(0x30), 100);
        let mut mem = vec![0u8; 100 * PAGE_SIZE];
        let subject: BuddySubject<'_> =
            BuddySubject::new(&mut descs, &mut mem, PAGE_SIZE).unwrap();

        let ops = vec![
            AllocatorOp::Alloc(3),
            AllocatorOp::Custom(BuddyOp::Reserve { start: 4, len: 40 }),
            AllocatorOp::Alloc(0),
            AllocatorOp::Alloc(5),
            AllocatorOp::Free(0),
            AllocatorOp::Custom(BuddyOp::Restore(1)),
            AllocatorOp::Alloc(2),
            AllocatorOp::Custom(BuddyOp::Restore(0)),
            AllocatorOp::Free(1),
        ];

        let mut eval = Evaluator::new(subject);
        eval.evaluate(ops).unwrap();

        let subject = eval.into_subject();
        let reserved: usize = subject.reserved.iter().map(|&(_, count)| count).sum();
        assert_eq!(subject.allocator().free_page_count() + reserved, 100);
    }

    #[test]
    fn generated_ops() {
        let bytes: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut un = Unstructured::new(&bytes);
        let ops = Vec::<AllocatorOp<BuddyOp>>::arbitrary(&mut un).unwrap();

        let mut descs = descriptor_array(Pfn(0), 300);
        let mut mem = vec![0u8; 300 * PAGE_SIZE];
        let subject: BuddySubject<'_, 6> =
            BuddySubject::new(&mut descs, &mut mem, PAGE_SIZE).unwrap();

        Evaluator::new(subject).evaluate(ops).unwrap();
    }
}
