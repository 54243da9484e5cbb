//! Fuzz target for stop detection.
//!
//! Feeds arbitrary token texts through the detector and checks that the
//! emitted text is always a prefix of the input, so nothing is invented,
//! reordered or duplicated by holdback.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use eva_core::engine::{StopConfig, StopDetector, ThinkMarkers, Verdict};

#[derive(Debug, Arbitrary)]
struct Input {
    antiprompts: Vec<String>,
    pieces: Vec<String>,
    think: bool,
    leak: bool,
}

fuzz_target!(|input: Input| {
    let config = StopConfig {
        antiprompts: input.antiprompts,
        max_predict: -1,
        think_markers: input.think.then(ThinkMarkers::default),
        halt_on_template_leak: input.leak,
        ..Default::default()
    };
    let Ok(mut detector) = StopDetector::new(config) else {
        return;
    };

    let fed: String = input.pieces.concat();
    let mut emitted = String::new();
    let mut stopped = false;
    for piece in &input.pieces {
        let scan = detector.feed(piece);
        for chunk in &scan.chunks {
            assert!(!chunk.text.is_empty(), "empty chunk emitted");
            emitted.push_str(&chunk.text);
        }
        if let Verdict::Stop(_) = scan.verdict {
            stopped = true;
            break;
        }
    }
    if !stopped {
        if let Some(chunk) = detector.flush() {
            emitted.push_str(&chunk.text);
        }
        assert_eq!(emitted, fed, "unstopped stream must be emitted whole");
    }
    assert!(fed.starts_with(&emitted), "emitted text is not a prefix of the input");
});
