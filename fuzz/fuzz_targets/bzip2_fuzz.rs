#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The decoder must reject damaged streams without panicking.
    let _ = oxipatch::compress::decompress(data);
});
