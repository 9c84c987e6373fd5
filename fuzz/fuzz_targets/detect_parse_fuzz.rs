#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Detection and parsing must never panic, only return errors.
    if let Ok(patch) = oxipatch::detect_and_parse(data) {
        let _ = patch.info();
        // Whatever parsed must serialize and parse back to the same format.
        if let Ok(bytes) = patch.serialize() {
            let again = oxipatch::detect_and_parse(&bytes).unwrap();
            assert_eq!(again.format(), patch.format());
        }
    }
});
