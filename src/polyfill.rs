//! Polyfills for strict-provenance pointer methods.
//!
//! These mirror the inherent methods of newer toolchains, so that frame
//! addresses can be computed without casting integers back to pointers.

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;

    fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
    }

    fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
    where
        T: Sized,
    {
        self.with_addr(f(self.addr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trips() {
        let mut word = 0u64;
        let ptr = NonNull::from(&mut word);

        assert_eq!(ptr.with_addr(ptr.addr()), ptr);

        let bumped = NonNullStrict::map_addr(ptr, |a| a.checked_add(8).unwrap());
        assert_eq!(NonNullStrict::addr(bumped).get(), NonNullStrict::addr(ptr).get() + 8);
    }
}
