use core::fmt;

#[cfg(any(feature = "alloc", test))]
use alloc::vec::Vec;

use crate::{InitError, Pfn};

/// Per-frame metadata.
///
/// A descriptor is identified by the frame it describes. While its frame is
/// the head of a free block, the descriptor links to the head of the next
/// free block of the same order; otherwise the link is meaningless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageDescriptor {
    pfn: Pfn,
    // Rather than a pointer, store the frame number of the next free block.
    // The allocator resolves it through the descriptor table, so no borrow of
    // another descriptor is ever held.
    next_free: Option<Pfn>,
}

impl PageDescriptor {
    /// Creates a descriptor for frame `pfn`.
    pub const fn new(pfn: Pfn) -> PageDescriptor {
        PageDescriptor {
            pfn,
            next_free: None,
        }
    }

    /// Returns the frame described by this descriptor.
    #[inline]
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Returns the free-list link.
    ///
    /// This is only meaningful while the frame heads a free block.
    #[inline]
    pub fn next_free(&self) -> Option<Pfn> {
        self.next_free
    }
}

/// Creates descriptors for `count` consecutive frames starting at `base`.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
pub fn descriptor_array(base: Pfn, count: usize) -> Vec<PageDescriptor> {
    (0..count).map(|i| PageDescriptor::new(base + i)).collect()
}

/// A table of descriptors for consecutive frames.
///
/// This is the translation between frame numbers and descriptors: the
/// descriptor for frame `pfn` lives at index `pfn - base`.
pub struct PageDescriptors<'a> {
    base: Pfn,
    descriptors: &'a mut [PageDescriptor],
}

impl<'a> PageDescriptors<'a> {
    /// Wraps a descriptor array.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the descriptors do not describe consecutive frames in
    /// ascending order.
    pub fn new(descriptors: &'a mut [PageDescriptor]) -> Result<PageDescriptors<'a>, InitError> {
        let base = descriptors.first().map_or(Pfn(0), |d| d.pfn);

        for (index, desc) in descriptors.iter().enumerate() {
            let expected = base.checked_add(index);
            if expected != Some(desc.pfn) {
                return Err(InitError::NonContiguous {
                    index,
                    expected: expected.unwrap_or(base),
                    found: desc.pfn,
                });
            }
        }

        Ok(PageDescriptors { base, descriptors })
    }

    /// Returns the first frame covered by the table.
    #[inline]
    pub fn base(&self) -> Pfn {
        self.base
    }

    /// Returns the number of frames covered by the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if the table covers no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Returns `true` if the table has a descriptor for `pfn`.
    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        self.index_of(pfn).is_some()
    }

    /// Returns `true` if the table has descriptors for all `count` frames
    /// starting at `start`.
    pub fn contains_range(&self, start: Pfn, count: usize) -> bool {
        match start.offset_from(self.base) {
            Some(ofs) => ofs
                .checked_add(count)
                .map_or(false, |end| end <= self.descriptors.len()),
            None => false,
        }
    }

    /// Returns the descriptor for `pfn`.
    #[inline]
    pub fn address_of(&self, pfn: Pfn) -> Option<&PageDescriptor> {
        self.index_of(pfn).map(|i| &self.descriptors[i])
    }

    /// Returns the frame described by `descriptor`.
    #[inline]
    pub fn pfn_of(&self, descriptor: &PageDescriptor) -> Pfn {
        descriptor.pfn
    }

    #[inline]
    fn index_of(&self, pfn: Pfn) -> Option<usize> {
        pfn.offset_from(self.base)
            .filter(|&ofs| ofs < self.descriptors.len())
    }

    /// Returns the free-list link stored in the descriptor for `pfn`.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not covered by the table.
    #[inline]
    pub(crate) fn next(&self, pfn: Pfn) -> Option<Pfn> {
        let index = self
            .index_of(pfn)
            .unwrap_or_else(|| panic!("frame {pfn} not covered by descriptor table"));

        self.descriptors[index].next_free
    }

    /// Sets the free-list link stored in the descriptor for `pfn`.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not covered by the table.
    #[inline]
    pub(crate) fn set_next(&mut self, pfn: Pfn, next: Option<Pfn>) {
        debug_assert!(
            next.map_or(true, |n| self.contains(n)),
            "next link out of table"
        );

        let index = self
            .index_of(pfn)
            .unwrap_or_else(|| panic!("frame {pfn} not covered by descriptor table"));

        self.descriptors[index].next_free = next;
    }
}

impl fmt::Debug for PageDescriptors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDescriptors")
            .field("base", &self.base)
            .field("len", &self.descriptors.len())
            .finish()
    }
}
