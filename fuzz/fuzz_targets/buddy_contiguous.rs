#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use page_buddy::{descriptor_array, Pfn};
use page_hater::{AllocatorOp, BuddyOp, BuddySubject, Evaluator};

const PAGE_SIZE: usize = 64;
const LEVELS: usize = 8;

const MAX_FRAMES: usize = 4096;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    base: u16,
    num_frames: usize,
    ops: Vec<AllocatorOp<BuddyOp>>,
}

fuzz_target!(|args: Args| {
    let Args {
        base,
        num_frames,
        ops,
    } = args;

    let num_frames = num_frames % MAX_FRAMES;

    let mut descs = descriptor_array(Pfn(base.into()), num_frames);
    let mut mem = vec![0u8; num_frames * PAGE_SIZE];

    let subject: BuddySubject<'_, LEVELS> =
        match BuddySubject::new(&mut descs, &mut mem, PAGE_SIZE) {
            Ok(s) => s,
            Err(_) => return,
        };

    if let Err(failed) = Evaluator::new(subject).evaluate(ops) {
        panic!(
            "\nevaluation failed.\nnum frames: {num_frames}\ncompleted: {:?}\nfailed: {:?}",
            failed.completed, failed.failed_op
        );
    }
});
