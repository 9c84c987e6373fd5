#![no_main]
use libfuzzer_sys::fuzz_target;
use oxipatch::{ApplyOptions, BuildOptions, PatchFormat};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte selects the format, the rest is split into two images.
    let buildable: Vec<PatchFormat> = PatchFormat::ALL
        .into_iter()
        .filter(|f| f.can_build())
        .collect();
    let format = buildable[data[0] as usize % buildable.len()];
    let payload = &data[1..];
    let (original, modified) = payload.split_at(payload.len() / 2);
    if matches!(format, PatchFormat::Ppf | PatchFormat::Ebp) && original.len() > modified.len() {
        return;
    }

    let options = BuildOptions {
        verify: false,
        ..Default::default()
    };
    let patch = oxipatch::build(original, modified, format, &options).unwrap();
    let bytes = patch.serialize().unwrap();
    let parsed = oxipatch::detect_and_parse(&bytes).unwrap();
    let out = oxipatch::apply(original, &parsed, &ApplyOptions::default()).unwrap();
    assert_eq!(out.data, modified);
});
