//! Mapping frame numbers to memory.
//!
//! The allocator itself deals only in frame numbers. A [`FrameRegion`]
//! translates them to pointers into a mapped region of physical memory, such
//! as a kernel's direct map, and back again.

use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{order::pages_in_block, Pfn};

/// A pointer to mapped memory backing a run of consecutive frames.
///
/// Pointers produced by a `FrameRegion` carry the provenance of the pointer
/// it was created from.
#[derive(Copy, Clone, Debug)]
pub struct FrameRegion {
    ptr: NonNull<u8>,
    base: Pfn,
    num_frames: usize,
    page_size: usize,
}

impl FrameRegion {
    /// Creates a `FrameRegion` for `num_frames` frames of `page_size` bytes,
    /// the first of which is frame `base` and is mapped at `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two, or if the end of the
    /// region overflows `usize`.
    pub fn new(ptr: NonNull<u8>, base: Pfn, num_frames: usize, page_size: usize) -> FrameRegion {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        num_frames
            .checked_mul(page_size)
            .and_then(|extent| ptr.addr().get().checked_add(extent))
            .expect("region limit overflows usize");

        base.checked_add(num_frames)
            .expect("frame numbers overflow usize");

        FrameRegion {
            ptr,
            base,
            num_frames,
            page_size,
        }
    }

    /// Returns the pointer to the first frame.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the number of the first frame.
    #[inline]
    pub fn base(&self) -> Pfn {
        self.base
    }

    /// Returns the size of a frame in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of frames in the region.
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(&self) -> NonZeroUsize {
        // Checked in the constructor.
        self.ptr
            .addr()
            .checked_add(self.num_frames * self.page_size)
            .unwrap()
    }

    /// Returns `true` if `addr` lies within the region.
    #[inline]
    pub fn contains_addr(&self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Returns `true` if frame `pfn` lies within the region.
    #[inline]
    pub fn contains_pfn(&self, pfn: Pfn) -> bool {
        pfn.offset_from(self.base)
            .map_or(false, |ofs| ofs < self.num_frames)
    }

    /// Returns a pointer to the start of frame `pfn`.
    pub fn address_of(&self, pfn: Pfn) -> Option<NonNull<u8>> {
        let ofs = pfn.offset_from(self.base)?;
        if ofs >= self.num_frames {
            return None;
        }

        Some(self.ptr.map_addr(|a| {
            // Can't overflow: the region limit fits in a usize.
            a.checked_add(ofs * self.page_size).unwrap()
        }))
    }

    /// Returns a pointer to the memory of the order-`order` block at `head`.
    ///
    /// Returns `None` unless the whole block lies within the region.
    pub fn block_of(&self, head: Pfn, order: usize) -> Option<NonNull<[u8]>> {
        let pages = pages_in_block(order);

        let ofs = head.offset_from(self.base)?;
        if ofs.checked_add(pages)? > self.num_frames {
            return None;
        }

        let start = self.address_of(head)?;
        NonNull::new(ptr::slice_from_raw_parts_mut(
            start.as_ptr(),
            pages * self.page_size,
        ))
    }

    /// Returns the frame containing the byte at `ptr`.
    ///
    /// Returns `None` if `ptr` lies outside the region.
    pub fn pfn_of(&self, ptr: NonNull<u8>) -> Option<Pfn> {
        let addr = ptr.addr();
        if !self.contains_addr(addr) {
            return None;
        }

        let ofs = addr.get() - self.ptr.addr().get();
        Some(self.base + ofs / self.page_size)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    const PAGE: usize = 64;

    fn backing(frames: usize) -> Vec<u64> {
        std::vec![0; frames * PAGE / 8]
    }

    #[test]
    fn maps_frames_to_addresses() {
        let mut mem = backing(8);
        let ptr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let region = FrameRegion::new(ptr, Pfn(0x40), 8, PAGE);

        assert_eq!(region.address_of(Pfn(0x40)), Some(ptr));
        assert_eq!(
            region.address_of(Pfn(0x43)).unwrap().as_ptr() as usize,
            ptr.as_ptr() as usize + 3 * PAGE
        );
        assert_eq!(region.address_of(Pfn(0x48)), None);
        assert_eq!(region.address_of(Pfn(0x3F)), None);
    }

    #[test]
    fn maps_addresses_to_frames() {
        let mut mem = backing(8);
        let ptr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let region = FrameRegion::new(ptr, Pfn(0x40), 8, PAGE);

        for pfn in 0x40..0x48 {
            let addr = region.address_of(Pfn(pfn)).unwrap();
            assert_eq!(region.pfn_of(addr), Some(Pfn(pfn)));

            let last_byte = addr.map_addr(|a| a.checked_add(PAGE - 1).unwrap());
            assert_eq!(region.pfn_of(last_byte), Some(Pfn(pfn)));
        }

        let past_end = ptr.map_addr(|a| a.checked_add(8 * PAGE).unwrap());
        assert_eq!(region.pfn_of(past_end), None);
        assert!(!region.contains_pfn(Pfn(0x48)));
    }

    #[test]
    fn blocks_must_fit() {
        let mut mem = backing(8);
        let ptr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let region = FrameRegion::new(ptr, Pfn(0), 8, PAGE);

        let block = region.block_of(Pfn(4), 2).unwrap();
        assert_eq!(block.len(), 4 * PAGE);
        assert_eq!(block.cast::<u8>(), region.address_of(Pfn(4)).unwrap());

        assert!(region.block_of(Pfn(0), 3).is_some());
        assert!(region.block_of(Pfn(4), 3).is_none());
    }

    #[test]
    fn blocks_are_writable() {
        let mut mem = backing(4);
        let ptr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let region = FrameRegion::new(ptr, Pfn(0), 4, PAGE);

        let block = region.block_of(Pfn(2), 1).unwrap();
        // SAFETY: the block lies within `mem`, which outlives this borrow.
        unsafe { (*block.as_ptr()).fill(0xAB) };

        let bytes: Vec<u8> = mem.iter().flat_map(|w| w.to_ne_bytes()).collect();
        assert!(bytes[..2 * PAGE].iter().all(|&b| b == 0));
        assert!(bytes[2 * PAGE..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn page_size_must_be_power_of_two() {
        let mut mem = backing(1);
        let ptr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        FrameRegion::new(ptr, Pfn(0), 1, 48);
    }
}
