//! Fuzz target for UTF-8 reassembly.
//!
//! Arbitrary byte pieces must never panic the reassembler. Valid text cut
//! at character boundaries must come out unchanged.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use eva_core::engine::Utf8Reassembler;

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    cuts: Vec<u8>,
    raw: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    // raw bytes: only panics matter
    let mut utf8 = Utf8Reassembler::new();
    for (i, piece) in input.raw.iter().enumerate() {
        let _ = utf8.push(i as i32, piece);
    }
    utf8.discard();
    assert!(utf8.is_empty());

    // valid text split at char boundaries round-trips
    let bytes = input.text.as_bytes();
    let mut out = String::new();
    let mut start = 0;
    for (i, cut) in input.cuts.iter().enumerate() {
        let mut end = (start + usize::from(*cut)).min(bytes.len());
        while !input.text.is_char_boundary(end) {
            end += 1;
        }
        if end == start {
            continue;
        }
        out.push_str(&utf8.push(i as i32, &bytes[start..end]));
        start = end;
    }
    if start < bytes.len() {
        out.push_str(&utf8.push(-1, &bytes[start..]));
    }
    assert_eq!(out, input.text);
    assert!(utf8.is_empty());
});
