//! Decoder conformance: instruction lengths are checked against iced-x86
//! over a fixed corpus and randomized byte soup. Only encodings this core
//! accepts are compared; everything else must decode to a #UD record, never
//! a bogus length.

mod testkit;

use halcyon_cpu_core::decoder::{i_length, Op};
use iced_x86::{Code, Decoder as IcedDecoder, DecoderOptions};
use proptest::prelude::*;
use testkit::*;

/// Decode one instruction at 0x1000 in 32-bit mode and return the record.
fn decode_at(bytes: &[u8]) -> halcyon_cpu_core::decoder::DecodedInsn {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    load(&mut cpu, 0x1000, bytes);
    // Terminate the stream so the trace ends quickly.
    load(&mut cpu, 0x1000 + bytes.len() as u32, &[0xF4]);
    jump_to(&mut cpu, 0x1000);
    let idx = cpu.prefetch_trace().expect("fetch cannot fault here");
    cpu.trace_cache[idx]
}

fn iced_len(bytes: &[u8]) -> (u32, bool) {
    let mut dec = IcedDecoder::new(32, bytes, DecoderOptions::NONE);
    let insn = dec.decode();
    (insn.len() as u32, insn.code() == Code::INVALID)
}

#[test]
fn fixed_corpus_lengths_match_iced() {
    // A spread of forms: prefixes, ModR/M, SIB, moffs, imms, two-byte map.
    let corpus: &[&[u8]] = &[
        &[0x90],
        &[0x66, 0x90],
        &[0xB8, 1, 2, 3, 4],
        &[0x66, 0xB8, 1, 2],
        &[0x8B, 0x44, 0xB3, 0x08],
        &[0x8B, 0x80, 0x78, 0x56, 0x34, 0x12],
        &[0x67, 0x8B, 0x07],
        &[0xA1, 4, 0, 0, 0],
        &[0x00, 0xD8],
        &[0x83, 0xC0, 0x7F],
        &[0x81, 0xC3, 1, 2, 3, 4],
        &[0xF6, 0xC1, 0x55],
        &[0xF7, 0xE1],
        &[0xC1, 0xE0, 0x04],
        &[0xD1, 0xDB],
        &[0x0F, 0xB6, 0xC3],
        &[0x0F, 0xAF, 0xC3],
        &[0x0F, 0xA4, 0xD8, 0x03],
        &[0x0F, 0x90, 0xC0],
        &[0x0F, 0x4C, 0xCB],
        &[0xE8, 1, 0, 0, 0],
        &[0xE9, 0xFF, 0xFF, 0xFF, 0xFF],
        &[0x74, 0x10],
        &[0x0F, 0x84, 1, 2, 3, 4],
        &[0xC2, 0x08, 0x00],
        &[0x9A, 1, 2, 3, 4, 5, 6],
        &[0xCD, 0x21],
        &[0xF3, 0xA4],
        &[0x6A, 0x44],
        &[0x68, 1, 2, 3, 4],
        &[0xC8, 0x20, 0x00, 0x01],
        &[0x8D, 0x04, 0x8D, 0, 0, 0, 0],
        &[0xDD, 0x05, 0, 0, 0, 0],
        &[0xD9, 0xE8],
        &[0x0F, 0x28, 0x05, 0, 0, 0, 0],
        &[0x66, 0x0F, 0xEF, 0xC0],
        &[0x0F, 0x71, 0xF0, 0x10],
        &[0x66, 0x0F, 0x70, 0xC1, 0x1B],
        &[0x0F, 0xC8],
        &[0x0F, 0x01, 0x15, 0, 0, 0, 0],
        &[0x0F, 0x20, 0xC0],
        &[0x0F, 0xBA, 0xE0, 0x05],
    ];
    for bytes in corpus {
        let rec = decode_at(bytes);
        let (want, invalid) = iced_len(bytes);
        assert!(!invalid, "corpus entry must be valid: {bytes:02x?}");
        assert_ne!(rec.op, Op::Ud, "decoder rejected {bytes:02x?}");
        assert_eq!(
            i_length(rec.flags),
            want,
            "length mismatch for {bytes:02x?}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]
    #[test]
    fn random_bytes_never_mislength(bytes in proptest::collection::vec(any::<u8>(), 1..16)) {
        let rec = decode_at(&bytes);
        if rec.op != Op::Ud && rec.op != Op::Fatal {
            let (want, invalid) = iced_len(&bytes);
            if !invalid && want <= bytes.len() as u32 {
                prop_assert_eq!(
                    i_length(rec.flags), want,
                    "length mismatch for {:02x?} (op {:?})", bytes, rec.op
                );
            }
        }
    }
}
