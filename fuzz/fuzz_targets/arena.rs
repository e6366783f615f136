#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use buddy_arena_hater::{ArenaOp, ArenaSubject};
use libfuzzer_sys::fuzz_target;

const MAX_TOTAL: usize = 1 << 20;
const MAX_PAGE_SHIFT: u8 = 12; // 4096 bytes

#[derive(Clone, Debug)]
struct Args {
    total: usize,
    used: usize,
    page: usize,
    ops: Vec<AllocatorOp<ArenaOp>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let page = 1_usize << (u8::arbitrary(un)? % MAX_PAGE_SHIFT);
        let total = usize::arbitrary(un)? % MAX_TOTAL;
        let used = match total {
            0 => 0,
            _ => usize::arbitrary(un)? % total,
        };
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            total,
            used,
            page,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        total,
        used,
        page,
        ops,
    } = args;

    let arena = match ArenaSubject::new(total, used, page) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(arena);
    eval.evaluate(ops).unwrap();
});
