#![no_main]

use std::ops::Range;

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use page_buddy::{descriptor_array, Pfn, ORDER_COUNT};
use page_hater::{AllocatorOp, BuddyOp, BuddySubject, Evaluator};

const PAGE_SIZE: usize = 64;

const MAX_FRAMES: usize = 4096;

#[derive(Clone, Debug)]
struct Args {
    base: usize,
    num_frames: usize,
    holes: Vec<Range<usize>>,
    ops: Vec<AllocatorOp<BuddyOp>>,
}

// Generates arbitrary, non-overlapping holes to punch in the pool.
fn holes(un: &mut Unstructured, num_frames: usize) -> arbitrary::Result<Vec<Range<usize>>> {
    if num_frames == 0 {
        return Ok(Vec::new());
    }

    let num_bounds = usize::arbitrary(un)? % 16;

    let mut boundaries = Vec::with_capacity(num_bounds);
    for _ in 0..num_bounds {
        let bound = usize::arbitrary(un)? % num_frames;
        boundaries.push(bound);
    }
    boundaries.sort_unstable();
    boundaries.dedup();

    Ok(boundaries
        .chunks_exact(2)
        .map(|s| s[0]..s[1])
        .collect())
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let base = usize::from(u16::arbitrary(un)?);
        let num_frames = usize::arbitrary(un)? % MAX_FRAMES;
        let holes = holes(un, num_frames)?;

        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            base,
            num_frames,
            holes,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        base,
        num_frames,
        holes,
        ops,
    } = args;

    let mut descs = descriptor_array(Pfn(base), num_frames);
    let mut mem = vec![0u8; num_frames * PAGE_SIZE];

    let mut subject: BuddySubject<'_, ORDER_COUNT> =
        match BuddySubject::new(&mut descs, &mut mem, PAGE_SIZE) {
            Ok(s) => s,
            Err(_) => return,
        };

    for hole in &holes {
        subject.reserve(hole.start, hole.end - hole.start);
    }

    if let Err(failed) = Evaluator::new(subject).evaluate(ops) {
        panic!(
            "\nevaluation failed.\nnum frames: {num_frames}\nholes: {holes:?}\ncompleted: {:?}\nfailed: {:?}",
            failed.completed, failed.failed_op
        );
    }
});
