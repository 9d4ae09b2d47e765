use spin::{Mutex, MutexGuard};

use crate::{InitError, PageAllocatorAlgorithm, Pfn};

/// A page allocator behind a spinlock.
///
/// Every operation takes the lock for its whole duration, so the free lists
/// are never observed mid-update. Nothing here blocks or sleeps.
///
/// # Example
///
/// ```
/// use page_buddy::{BuddyPageAllocator, LockedPageAllocator, PageDescriptor, Pfn};
///
/// let mut descriptors: Vec<PageDescriptor> =
///     (0..16).map(|i| PageDescriptor::new(Pfn(i))).collect();
///
/// let buddy: BuddyPageAllocator<'_> = BuddyPageAllocator::new(&mut descriptors).unwrap();
/// let pages = LockedPageAllocator::new(buddy);
/// pages.init(Pfn(0), 16).unwrap();
///
/// let block = pages.allocate_pages(2).unwrap();
/// pages.free_pages(block, 2);
/// ```
#[derive(Debug)]
pub struct LockedPageAllocator<A> {
    inner: Mutex<A>,
}

impl<A> LockedPageAllocator<A> {
    /// Wraps `inner` in a lock.
    pub const fn new(inner: A) -> LockedPageAllocator<A> {
        LockedPageAllocator {
            inner: Mutex::new(inner),
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    /// Consumes the lock, returning the wrapped allocator.
    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<A: PageAllocatorAlgorithm> LockedPageAllocator<A> {
    /// Returns the name of the wrapped algorithm.
    pub fn name(&self) -> &'static str {
        self.lock().name()
    }

    /// Makes `count` frames starting at `start` available for allocation.
    ///
    /// # Errors
    ///
    /// See [`PageAllocatorAlgorithm::init`].
    pub fn init(&self, start: Pfn, count: usize) -> Result<(), InitError> {
        self.lock().init(start, count)
    }

    /// Allocates `2^order` contiguous frames, returning the first.
    pub fn allocate_pages(&self, order: usize) -> Option<Pfn> {
        self.lock().allocate_pages(order)
    }

    /// Frees the `2^order` contiguous frames starting at `head`.
    pub fn free_pages(&self, head: Pfn, order: usize) {
        self.lock().free_pages(head, order)
    }

    /// Marks `count` frames starting at `start` as available.
    pub fn insert_page_range(&self, start: Pfn, count: usize) {
        self.lock().insert_page_range(start, count)
    }

    /// Marks `count` frames starting at `start` as unavailable.
    pub fn remove_page_range(&self, start: Pfn, count: usize) {
        self.lock().remove_page_range(start, count)
    }

    /// Logs the current state of the wrapped allocator.
    pub fn dump_state(&self) {
        self.lock().dump_state()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{prelude::rust_2021::*, thread};

    use super::*;
    use crate::{descriptor::descriptor_array, BuddyPageAllocator};

    #[test]
    fn concurrent_allocation_is_exclusive() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 64;

        let mut descs = descriptor_array(Pfn(0), THREADS * PER_THREAD);
        let buddy: BuddyPageAllocator<'_> = BuddyPageAllocator::new(&mut descs).unwrap();
        let pages = LockedPageAllocator::new(buddy);
        pages.init(Pfn(0), THREADS * PER_THREAD).unwrap();

        let shared = &pages;
        let mut all: Vec<Pfn> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        for _ in 0..PER_THREAD {
                            mine.push(shared.allocate_pages(0).unwrap());
                        }
                        mine
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(pages.allocate_pages(0), None);

        all.sort();
        all.dedup();
        assert_eq!(all.len(), THREADS * PER_THREAD);

        for pfn in all {
            pages.free_pages(pfn, 0);
        }

        let buddy = pages.into_inner();
        assert_eq!(buddy.free_blocks().collect::<Vec<_>>(), [(Pfn(0), 8)]);
    }

    #[test]
    fn range_ops_through_lock() {
        let mut descs = descriptor_array(Pfn(0), 32);
        let buddy: BuddyPageAllocator<'_> = BuddyPageAllocator::new(&mut descs).unwrap();
        let pages = LockedPageAllocator::new(buddy);

        assert_eq!(pages.name(), "buddy");

        pages.insert_page_range(Pfn(0), 32);
        pages.remove_page_range(Pfn(0), 16);
        assert_eq!(pages.allocate_pages(4), Some(Pfn(16)));
        assert_eq!(pages.allocate_pages(0), None);

        pages.dump_state();
        assert_eq!(pages.lock().free_page_count(), 0);
    }
}
