#![no_main]
use libfuzzer_sys::fuzz_target;
use oxipatch::ApplyOptions;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte picks the split between ROM and patch.
    let split = (data[0] as usize * (data.len() - 1)) / 255;
    let (rom, patch) = data[1..].split_at(split.min(data.len() - 1));

    let Ok(patch) = oxipatch::detect_and_parse(patch) else {
        return;
    };
    // Keep declared sizes small enough not to exhaust memory.
    if patch.target_size().is_some_and(|s| s > 1 << 24) {
        return;
    }
    let options = ApplyOptions {
        require_source_validation: false,
        ..Default::default()
    };
    let _ = oxipatch::apply(rom, &patch, &options);
});
