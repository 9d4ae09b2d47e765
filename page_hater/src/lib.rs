//! A small library for ~~hating on~~ evaluating the correctness of page
//! allocators.
#![deny(unsafe_op_in_unsafe_fn)]

mod buddy;

pub use crate::buddy::{BuddyOp, BuddySubject};

use std::{fmt::Debug, mem::MaybeUninit, ptr::NonNull, slice};

/// The largest order requested by generated operations.
pub const MAX_ARB_ORDER: usize = 12;

/// A block order which implements `Arbitrary`.
///
/// Orders are drawn from `0..=MAX_ARB_ORDER`.
#[derive(Clone, Copy, Debug)]
pub struct ArbOrder(pub usize);

impl arbitrary::Arbitrary<'_> for ArbOrder {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let order = usize::from(u8::arbitrary(u)?) % (MAX_ARB_ORDER + 1);
        Ok(ArbOrder(order))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Free,
    Custom,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp<C> {
    /// Allocate a block of the given order.
    Alloc(usize),
    /// Free an outstanding block, chosen modulo the number of blocks.
    Free(usize),
    /// An operation specific to the subject.
    Custom(C),
}

impl<'a, C: arbitrary::Arbitrary<'a>> arbitrary::Arbitrary<'a> for AllocatorOp<C> {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbOrder::arbitrary(u)?.0),
            AllocatorOpTag::Free => AllocatorOp::Free(usize::arbitrary(u)?),
            AllocatorOpTag::Custom => AllocatorOp::Custom(C::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type Op: for<'a> arbitrary::Arbitrary<'a> + Clone + Debug;

    /// Allocates a block of `2^order` pages, returning its memory.
    fn allocate_pages(&mut self, order: usize) -> Option<NonNull<[u8]>>;

    /// Frees the block of `2^order` pages whose memory is `block`.
    ///
    /// # Safety
    ///
    /// `block` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `order`.
    unsafe fn free_pages(&mut self, block: NonNull<[u8]>, order: usize);

    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }

    /// Checks the subject's internal bookkeeping.
    fn is_consistent(&self) -> bool {
        true
    }
}

/// Blocks handed out by a subject and not yet returned.
#[derive(Default)]
pub struct Outstanding {
    blocks: Vec<Block>,
}

impl Outstanding {
    pub fn new() -> Outstanding {
        Outstanding { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Takes the block at `index` modulo the number of outstanding blocks.
    pub fn take(&mut self, index: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(index % len))
    }

    /// Takes every outstanding block, oldest first.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Block> {
        self.blocks.drain(..)
    }
}

/// An allocated block of pages, filled with a pattern derived from the ID of
/// the operation that last wrote it.
pub struct Block {
    mem: NonNull<[u8]>,
    order: usize,
    id: u64,
}

impl Block {
    /// Takes ownership of the memory of an order-`order` block and stamps it
    /// with `id`.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for reads and writes of `mem.len()` bytes, and
    /// must not be accessed other than through the returned `Block` until
    /// the block is released with [`Block::release`].
    pub unsafe fn stamp(mem: NonNull<[u8]>, order: usize, id: u64) -> Block {
        let mut block = Block { mem, order, id };
        block.restamp(id);
        block
    }

    fn bytes_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: the block owns its memory, and `self` is borrowed mutably.
        unsafe { slice::from_raw_parts_mut(self.mem.cast().as_ptr(), self.mem.len()) }
    }

    /// Overwrites the block's contents with the pattern for `id`.
    pub fn restamp(&mut self, id: u64) {
        let pattern = id.to_le_bytes().into_iter().cycle();
        for (byte, value) in self.bytes_mut().iter_mut().zip(pattern) {
            byte.write(value);
        }

        self.id = id;
    }

    /// Returns `true` if the block still holds the pattern of its last stamp.
    pub fn is_intact(&self) -> bool {
        // SAFETY: every byte was written by `restamp`.
        let bytes: &[u8] = unsafe { self.mem.as_ref() };
        let pattern = self.id.to_le_bytes().into_iter().cycle();

        bytes.iter().zip(pattern).all(|(byte, value)| *byte == value)
    }

    /// Gives up the block, returning its memory and order.
    pub fn release(self) -> (NonNull<[u8]>, usize) {
        (self.mem, self.order)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed<C> {
    pub completed: Vec<AllocatorOp<C>>,
    pub failed_op: Option<AllocatorOp<C>>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed<S::Op>>
    where
        I: IntoIterator<Item = AllocatorOp<S::Op>>,
    {
        let mut completed = Vec::new();
        let mut outstanding = Outstanding::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op.clone() {
                AllocatorOp::Alloc(order) => {
                    let mem = match self.subject.allocate_pages(order) {
                        Some(m) => m,
                        None => continue,
                    };

                    // SAFETY: the subject hands out memory it no longer uses.
                    outstanding.push(unsafe { Block::stamp(mem, order, op_id) });
                }

                AllocatorOp::Free(raw_idx) => {
                    let mut block = match outstanding.take(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.is_intact() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    block.restamp(op_id);

                    let (mem, order) = block.release();
                    // SAFETY: `mem` came from `allocate_pages` with `order`.
                    unsafe { self.subject.free_pages(mem, order) };
                }

                AllocatorOp::Custom(custom) => self.subject.handle_custom_op(custom),
            }

            if !self.subject.is_consistent() {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        for block in outstanding.drain() {
            if !block.is_intact() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            let (mem, order) = block.release();
            // SAFETY: as above.
            unsafe { self.subject.free_pages(mem, order) };
        }

        if !self.subject.is_consistent() {
            return Err(Failed {
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out the same page over and over.
    struct Aliasing {
        page: Box<[u8]>,
    }

    impl Subject for Aliasing {
        type Op = ();

        fn allocate_pages(&mut self, _order: usize) -> Option<NonNull<[u8]>> {
            Some(NonNull::from(&mut *self.page))
        }

        unsafe fn free_pages(&mut self, _block: NonNull<[u8]>, _order: usize) {}
    }

    #[test]
    fn overlapping_blocks_are_caught() {
        let mut eval = Evaluator::new(Aliasing {
            page: vec![0; 64].into_boxed_slice(),
        });

        let ops = [AllocatorOp::Alloc(0), AllocatorOp::Alloc(0), AllocatorOp::Free(0)];
        let failed = eval.evaluate(ops).unwrap_err();

        assert_eq!(failed.completed.len(), 2);
        assert!(matches!(failed.failed_op, Some(AllocatorOp::Free(0))));
    }
}
