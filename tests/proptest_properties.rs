use oxipatch::vlv::{read_vlv, write_vlv};
use oxipatch::{ApplyOptions, BuildOptions, PatchFormat, apply, build, detect_and_parse};
use proptest::prelude::*;

const BUILDABLE: [PatchFormat; 8] = [
    PatchFormat::Ips,
    PatchFormat::Ebp,
    PatchFormat::Ups,
    PatchFormat::Bps,
    PatchFormat::ApsN64,
    PatchFormat::Ppf,
    PatchFormat::Rup,
    PatchFormat::Vcdiff,
];

fn unverified() -> BuildOptions {
    BuildOptions {
        verify: false,
        ..Default::default()
    }
}

/// Formats without a way to express a shrinking image.
fn cannot_shrink(format: PatchFormat, original: &[u8], modified: &[u8]) -> bool {
    matches!(format, PatchFormat::Ppf | PatchFormat::Ebp) && original.len() > modified.len()
}

/// An original plus a modified copy with a few edits and a resize, which
/// is closer to a real hack than two random buffers.  Growth pads with
/// either zeros or the first byte.
fn image_pair() -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
    (
        proptest::collection::vec(any::<u8>(), 0..4096),
        proptest::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 0..16),
        -256i32..512,
        any::<bool>(),
    )
        .prop_map(|(original, edits, resize, zero_fill)| {
            let mut modified = original.clone();
            for (index, byte) in edits {
                if !modified.is_empty() {
                    let at = index.index(modified.len());
                    modified[at] = byte;
                }
            }
            let new_len = (modified.len() as i32 + resize).max(0) as usize;
            let fill = if zero_fill {
                0
            } else {
                modified.first().copied().unwrap_or(0x5A)
            };
            modified.resize(new_len, fill);
            (original, modified)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_built_patches_reproduce_modified((original, modified) in image_pair()) {
        for format in BUILDABLE {
            if cannot_shrink(format, &original, &modified) {
                continue;
            }
            let patch = build(&original, &modified, format, &unverified()).unwrap();
            let parsed = detect_and_parse(&patch.serialize().unwrap()).unwrap();
            let out = apply(&original, &parsed, &ApplyOptions::default()).unwrap();
            prop_assert_eq!(out.data, modified.clone(), "{}", format);
        }
    }

    #[test]
    fn prop_serialize_is_a_fixed_point((original, modified) in image_pair()) {
        for format in BUILDABLE {
            if format == PatchFormat::Ebp && original.len() > modified.len() {
                continue;
            }
            let patch = build(&original, &modified, format, &unverified()).unwrap();
            let bytes = patch.serialize().unwrap();
            let reparsed = detect_and_parse(&bytes).unwrap();
            prop_assert_eq!(reparsed.serialize().unwrap(), bytes, "{}", format);
        }
    }

    #[test]
    fn prop_identical_images_validate(original in proptest::collection::vec(any::<u8>(), 1..2048)) {
        for format in [PatchFormat::Ups, PatchFormat::Bps, PatchFormat::Rup] {
            let patch = build(&original, &original, format, &BuildOptions::default()).unwrap();
            prop_assert!(patch.validate_source(&original));
            prop_assert_eq!(patch.apply_to(&original, true).unwrap(), original.clone());
        }
    }

    #[test]
    fn prop_detection_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = detect_and_parse(&data);
    }

    #[test]
    fn prop_vlv_round_trip(value in any::<u64>()) {
        let mut out = Vec::new();
        write_vlv(&mut out, value);
        let mut cursor = oxipatch::cursor::ByteCursor::new(&out);
        prop_assert_eq!(read_vlv(&mut cursor).unwrap(), value);
        prop_assert!(cursor.is_eof());
    }
}
