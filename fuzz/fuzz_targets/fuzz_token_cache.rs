//! Fuzz target for the token ledger.
//!
//! Random pushes, evictions and truncations must keep positions 1-based and
//! contiguous, and leave the protected prefix untouched.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use eva_core::memory::TokenCache;

#[derive(Debug, Arbitrary)]
enum Op {
    Push(i32),
    Filler,
    Media(u8),
    Evict { keep: u8, discard: u8 },
    Truncate(u8),
}

fuzz_target!(|ops: Vec<Op>| {
    let mut cache = TokenCache::new();
    for op in ops {
        match op {
            Op::Push(token) => cache.push(token, "t"),
            Op::Filler => cache.push_filler(),
            Op::Media(count) => cache.push_media(usize::from(count % 32), "<|image|>"),
            Op::Evict { keep, discard } => {
                let keep = usize::from(keep);
                let prefix = cache.entries()[..keep.min(cache.len())].to_vec();
                let before = cache.len();
                let removed = cache.evict(keep, usize::from(discard));
                assert_eq!(cache.len(), before - removed);
                assert_eq!(&cache.entries()[..prefix.len()], prefix.as_slice());
            }
            Op::Truncate(len) => cache.truncate(usize::from(len)),
        }
        assert!(cache.is_contiguous());
    }
});
