use oxipatch::checksum::crc32;
use oxipatch::formats::PatchCodec;
use oxipatch::formats::bps::BpsPatch;
use oxipatch::formats::ips::{IpsPatch, IpsRecord};
use oxipatch::formats::ppf::{PpfPatch, PpfRecord};
use oxipatch::formats::ups::UpsPatch;
use oxipatch::header;
use oxipatch::{
    ApplyOptions, BuildOptions, ChecksumStage, Patch, PatchError, PatchFormat, apply, build,
    detect_and_parse,
};

fn flip_bit(bytes: &mut [u8], index: usize) {
    bytes[index] ^= 0x01;
}

#[test]
fn ips_byte_change_and_appended_tail() {
    let original = vec![0u8; 1024];
    let mut modified = original.clone();
    modified[100] = 0xFF;
    modified.extend_from_slice(b"ABCDEFGH");

    let patch = build(&original, &modified, PatchFormat::Ips, &BuildOptions::default()).unwrap();
    let Patch::Ips(ips) = &patch else {
        panic!("expected an IPS patch, got {:?}", patch.format());
    };
    assert_eq!(ips.records.len(), 2);
    assert_eq!(
        ips.records[0],
        IpsRecord::Simple {
            offset: 100,
            data: vec![0xFF],
        }
    );
    assert_eq!(ips.records[1].offset(), 1024);
    assert_eq!(ips.records[1].end(), modified.len());

    let bytes = patch.serialize().unwrap();
    let parsed = detect_and_parse(&bytes).unwrap();
    let out = apply(&original, &parsed, &ApplyOptions::default()).unwrap();
    assert_eq!(out.data, modified);
    assert_eq!(crc32(&out.data), crc32(&modified));
}

#[test]
fn ups_with_corrupted_patch_crc_fails_to_parse() {
    let original: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let mut modified = original.clone();
    modified[10..20].fill(0x77);

    let patch = build(&original, &modified, PatchFormat::Ups, &BuildOptions::default()).unwrap();
    let mut bytes = patch.serialize().unwrap();
    let last = bytes.len() - 1;
    flip_bit(&mut bytes, last);

    assert!(matches!(
        UpsPatch::parse(&bytes),
        Err(PatchError::ChecksumMismatch {
            stage: ChecksumStage::Patch
        })
    ));
    // The dispatcher commits to UPS and reports the same error.
    assert!(matches!(
        detect_and_parse(&bytes),
        Err(PatchError::ChecksumMismatch {
            stage: ChecksumStage::Patch
        })
    ));
}

#[test]
fn bps_with_corrupted_patch_crc_fails_to_parse() {
    let original = vec![1u8; 512];
    let mut modified = original.clone();
    modified[0] = 2;
    let patch = build(&original, &modified, PatchFormat::Bps, &BuildOptions::default()).unwrap();
    let mut bytes = patch.serialize().unwrap();
    let last = bytes.len() - 1;
    flip_bit(&mut bytes, last);
    assert!(matches!(
        BpsPatch::parse(&bytes),
        Err(PatchError::ChecksumMismatch {
            stage: ChecksumStage::Patch
        })
    ));
}

#[test]
fn ips_run_of_64k_splits_into_two_records() {
    let original = vec![0u8; 0x20000];
    let mut modified = original.clone();
    modified[0x100..0x100 + 0x10000].fill(0xAA);

    let patch = build(&original, &modified, PatchFormat::Ips, &BuildOptions::default()).unwrap();
    let Patch::Ips(ips) = &patch else {
        panic!("expected an IPS patch");
    };
    assert_eq!(ips.records.len(), 2);
    assert!(ips.records.iter().all(|r| r.len() <= 0xFFFF));
    assert_eq!(ips.records.iter().map(IpsRecord::len).sum::<usize>(), 0x10000);
    assert_eq!(patch.apply_to(&original, true).unwrap(), modified);
}

#[test]
fn ips_shrink_uses_truncation_trailer() {
    let original = vec![9u8; 4096];
    let modified = original[..3000].to_vec();
    let patch = build(&original, &modified, PatchFormat::Ips, &BuildOptions::default()).unwrap();
    let Patch::Ips(ips) = &patch else {
        panic!("expected an IPS patch");
    };
    assert_eq!(ips.truncate, Some(3000));
    assert_eq!(patch.apply_to(&original, true).unwrap(), modified);
}

#[test]
fn nes_header_round_trip_of_a_1mib_body() {
    let body: Vec<u8> = (0..1_048_576u32).map(|i| (i * 7 % 256) as u8).collect();
    let kind = header::fake_header_kind(&body, "Game.nes").unwrap();
    let headered = header::add_fake_header(&body, kind);
    assert_eq!(header::detect_header(&headered, "Game.nes"), Some(kind));
    assert_eq!(header::remove_header(&headered, kind), body);
}

#[test]
fn patch_made_against_headerless_body_applies_to_headered_dump() {
    let body: Vec<u8> = (0..262_144u32).map(|i| (i % 199) as u8).collect();
    let mut modified = body.clone();
    modified[0x7FC0..0x7FD0].copy_from_slice(b"TRANSLATED TITLE");
    let patch = build(&body, &modified, PatchFormat::Bps, &BuildOptions::default()).unwrap();

    let dump = header::add_fake_header(&body, &header::HEADERS[3]);
    let options = ApplyOptions {
        strip_header: true,
        file_name: Some("Game.smc".into()),
        ..Default::default()
    };
    let out = apply(&dump, &patch, &options).unwrap();
    assert_eq!(out.data.len(), dump.len());
    assert_eq!(&out.data[512..], &modified[..]);

    // Without stripping, the BPS source CRC rejects the headered dump.
    assert!(matches!(
        apply(&dump, &patch, &ApplyOptions::default()),
        Err(PatchError::ChecksumMismatch {
            stage: ChecksumStage::Source
        })
    ));
}

#[test]
fn wrong_source_is_rejected_unless_validation_is_off() {
    let original = vec![0x11u8; 1000];
    let mut modified = original.clone();
    modified[500] = 0;
    let patch = build(&original, &modified, PatchFormat::Ups, &BuildOptions::default()).unwrap();

    let other = vec![0x22u8; 1000];
    assert!(!patch.validate_source(&other));
    assert!(apply(&other, &patch, &ApplyOptions::default()).is_err());

    let lenient = ApplyOptions {
        require_source_validation: false,
        ..Default::default()
    };
    assert!(apply(&other, &patch, &lenient).is_ok());
}

#[test]
fn ebp_carries_metadata_through_detection() {
    let original = vec![0u8; 256];
    let mut modified = original.clone();
    modified[3] = 3;
    let options = BuildOptions {
        metadata: oxipatch::PatchMetadata {
            title: Some("Hack".into()),
            author: Some("someone".into()),
            description: None,
        },
        ..Default::default()
    };
    let patch = build(&original, &modified, PatchFormat::Ebp, &options).unwrap();
    let parsed = detect_and_parse(&patch.serialize().unwrap()).unwrap();
    assert_eq!(parsed.format(), PatchFormat::Ebp);
    let Patch::Ips(IpsPatch {
        metadata: Some(meta),
        ..
    }) = parsed
    else {
        panic!("expected EBP metadata");
    };
    assert_eq!(meta.title.as_deref(), Some("Hack"));
    assert_eq!(meta.author.as_deref(), Some("someone"));
}

#[test]
fn ppf_from_larger_original_skips_verification() {
    let original = vec![5u8; 600];
    let modified = vec![6u8; 400];
    let patch = build(&original, &modified, PatchFormat::Ppf, &BuildOptions::default()).unwrap();
    assert_eq!(patch.format(), PatchFormat::Ppf);
}

#[test]
fn growth_by_zero_bytes_round_trips_in_every_format() {
    let original = vec![1u8, 2, 3];
    let modified = vec![1u8, 2, 3, 0, 0];
    for format in PatchFormat::ALL.into_iter().filter(|f| f.can_build()) {
        let patch = build(&original, &modified, format, &BuildOptions::default())
            .unwrap_or_else(|e| panic!("{format}: {e}"));
        let parsed = detect_and_parse(&patch.serialize().unwrap()).unwrap();
        let out = apply(&original, &parsed, &ApplyOptions::default()).unwrap();
        assert_eq!(out.data, modified, "{format}");
    }
}

#[test]
fn ebp_refuses_to_shrink() {
    let original: Vec<u8> = (0..64).collect();
    let modified: Vec<u8> = (0..32).collect();
    assert!(matches!(
        build(&original, &modified, PatchFormat::Ebp, &BuildOptions::default()),
        Err(PatchError::UnsupportedFeature(_))
    ));
    // Plain IPS carries a truncation trailer instead.
    let patch = build(&original, &modified, PatchFormat::Ips, &BuildOptions::default()).unwrap();
    assert_eq!(patch.apply_to(&original, true).unwrap(), modified);
}

#[test]
fn disabling_verification_still_builds() {
    let original = b"hello world, hello world".to_vec();
    let modified = b"hello there, hello world!".to_vec();
    let options = BuildOptions {
        verify: false,
        ..Default::default()
    };
    for format in PatchFormat::ALL.into_iter().filter(|f| f.can_build()) {
        let patch = build(&original, &modified, format, &options).unwrap();
        assert_eq!(patch.apply_to(&original, true).unwrap(), modified, "{format}");
    }
}

#[test]
fn absurd_declared_sizes_are_refused() {
    let ups = UpsPatch {
        source_size: 0,
        target_size: 1 << 40,
        records: Vec::new(),
        source_crc: crc32(b""),
        target_crc: 0,
    };
    let parsed = detect_and_parse(&ups.serialize().unwrap()).unwrap();
    assert!(matches!(
        parsed.apply_to(b"", false),
        Err(PatchError::SizeLimitExceeded(_))
    ));

    let ppf = PpfPatch {
        version: 3,
        description: "far away".into(),
        image_type: 0,
        input_size: None,
        block_check: None,
        undo: false,
        records: vec![PpfRecord {
            offset: 1 << 40,
            data: vec![1],
            undo: None,
        }],
        file_id_diz: None,
    };
    assert!(matches!(
        ppf.apply(b"abc", false),
        Err(PatchError::SizeLimitExceeded(_))
    ));
}
