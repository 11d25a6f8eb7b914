#![no_main]

use libfuzzer_sys::fuzz_target;
use topicsocket::frame::decode;

// `decode` is a pure function with no I/O (SPEC_FULL.md §4.1), so fuzzing it
// needs no runtime or socket plumbing: just feed it arbitrary byte buffers
// and confirm it never panics, regardless of how the length fields or
// opcode nibble are set.
fuzz_target!(|data: &[u8]| {
    let _ = decode(data);
});
