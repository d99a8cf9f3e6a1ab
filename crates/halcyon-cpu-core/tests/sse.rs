//! SSE/MMX execution: gating, alignment, moves, packed integer and float
//! lanes.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

fn sse_cpu() -> halcyon_cpu_core::Cpu {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x1000);
    cpu.cr[4] |= CR4_OSFXSR;
    cpu
}

#[test]
fn sse_without_osfxsr_is_ud() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 6, 0x08, 0x2000, 0x8E);
    load(&mut cpu, 0x2000, &[0xF4]);
    // movaps xmm0, xmm1
    load(&mut cpu, 0x1000, &[0x0F, 0x28, 0xC1, 0xF4]);
    cpu.reg32[ESP] = 0x7000;
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.virt_eip(), 0x2001, "#UD handler entered");
}

#[test]
fn movaps_faults_on_misaligned_memory() {
    let mut cpu = sse_cpu();
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 13, 0x08, 0x2000, 0x8E);
    load(&mut cpu, 0x2000, &[0xF4]);
    // movaps xmm0, [0x8004], which is misaligned.
    load(&mut cpu, 0x1000, &[0x0F, 0x28, 0x05, 0x04, 0x80, 0x00, 0x00, 0xF4]);
    cpu.reg32[ESP] = 0x7000;
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.virt_eip(), 0x2001, "#GP handler entered");
}

#[test]
fn movups_tolerates_misalignment() {
    let mut cpu = sse_cpu();
    for n in 0..4 {
        write_mem32(&mut cpu, 0x8004 + n * 4, 0x1111_0000 + n);
    }
    // movups xmm2, [0x8004]; hlt
    load(&mut cpu, 0x1000, &[0x0F, 0x10, 0x15, 0x04, 0x80, 0x00, 0x00, 0xF4]);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.xmm32[8], 0x1111_0000);
    assert_eq!(cpu.xmm32[11], 0x1111_0003);
}

#[test]
fn pxor_and_paddd() {
    let mut cpu = sse_cpu();
    // pxor xmm0, xmm0; paddd xmm0, [0x8000]; movaps [0x8010], xmm0; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0x66, 0x0F, 0xEF, 0xC0, // pxor xmm0, xmm0
            0x66, 0x0F, 0xFE, 0x05, 0x00, 0x80, 0x00, 0x00, // paddd xmm0, [0x8000]
            0x0F, 0x29, 0x05, 0x10, 0x80, 0x00, 0x00, // movaps [0x8010], xmm0
            0xF4,
        ],
    );
    for n in 0..4u32 {
        write_mem32(&mut cpu, 0x8000 + n * 4, n + 1);
    }
    run_until_hlt(&mut cpu, 16);
    for n in 0..4u32 {
        assert_eq!(read_mem32(&cpu, 0x8010 + n * 4), n + 1);
    }
}

#[test]
fn packed_shift_saturates_on_large_count() {
    let mut cpu = sse_cpu();
    // MMX: psllw mm0, 16 zeroes every lane; psllw mm1, 3 stays in range.
    // movq mm0, [0x8000]; psllw mm0, 16; movq [0x8010], mm0
    // movq mm1, [0x8008]; psllw mm1, 3;  movq [0x8018], mm1; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0x0F, 0x6F, 0x05, 0x00, 0x80, 0x00, 0x00, // movq mm0, [0x8000]
            0x0F, 0x71, 0xF0, 0x10, // psllw mm0, 16
            0x0F, 0x7F, 0x05, 0x10, 0x80, 0x00, 0x00, // movq [0x8010], mm0
            0x0F, 0x6F, 0x0D, 0x08, 0x80, 0x00, 0x00, // movq mm1, [0x8008]
            0x0F, 0x71, 0xF1, 0x03, // psllw mm1, 3
            0x0F, 0x7F, 0x0D, 0x18, 0x80, 0x00, 0x00, // movq [0x8018], mm1
            0xF4,
        ],
    );
    write_mem32(&mut cpu, 0x8000, 0xFFFF_FFFF);
    write_mem32(&mut cpu, 0x8004, 0xFFFF_FFFF);
    write_mem32(&mut cpu, 0x8008, 0x0001_0001);
    write_mem32(&mut cpu, 0x800C, 0x0001_0001);
    run_until_hlt(&mut cpu, 32);
    assert_eq!(read_mem32(&cpu, 0x8010), 0, "count 16 saturates to zero");
    assert_eq!(read_mem32(&cpu, 0x8014), 0);
    assert_eq!(read_mem32(&cpu, 0x8018), 0x0008_0008);
}

#[test]
fn mmx_touch_claims_fpu_tags() {
    let mut cpu = sse_cpu();
    // pxor mm3, mm3; hlt
    load(&mut cpu, 0x1000, &[0x0F, 0xEF, 0xDB, 0xF4]);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.fpu.tag_word, 0, "all slots valid after an MMX op");
    assert_eq!(cpu.fpu.ftop, 0);
    assert_eq!(cpu.fpu.st[3].sign_exp, 0xFFFF, "MMX writes set the exponent");
}

#[test]
fn addps_lanes() {
    let mut cpu = sse_cpu();
    for (n, v) in [1.0f32, 2.0, 3.0, 4.0].iter().enumerate() {
        write_mem32(&mut cpu, 0x8000 + n as u32 * 4, v.to_bits());
        write_mem32(&mut cpu, 0x8010 + n as u32 * 4, (10.0f32 * (n as f32 + 1.0)).to_bits());
    }
    // movaps xmm0, [0x8000]; addps xmm0, [0x8010]; movaps [0x8020], xmm0; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0x0F, 0x28, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0x0F, 0x58, 0x05, 0x10, 0x80, 0x00, 0x00, //
            0x0F, 0x29, 0x05, 0x20, 0x80, 0x00, 0x00, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    for (n, want) in [11.0f32, 22.0, 33.0, 44.0].iter().enumerate() {
        let got = f32::from_bits(read_mem32(&cpu, 0x8020 + n as u32 * 4));
        assert_eq!(got, *want);
    }
}

#[test]
fn pshufd_reorders_dwords() {
    let mut cpu = sse_cpu();
    for n in 0..4u32 {
        write_mem32(&mut cpu, 0x8000 + n * 4, n);
    }
    // pshufd xmm0, [0x8000], 0x1B (reverse); movaps [0x8010], xmm0; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0x66, 0x0F, 0x70, 0x05, 0x00, 0x80, 0x00, 0x00, 0x1B, //
            0x0F, 0x29, 0x05, 0x10, 0x80, 0x00, 0x00, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    for n in 0..4u32 {
        assert_eq!(read_mem32(&cpu, 0x8010 + n * 4), 3 - n);
    }
}

#[test]
fn movd_between_gpr_and_mmx() {
    let mut cpu = sse_cpu();
    // movd mm2, eax; movd ebx, mm2; hlt
    load(&mut cpu, 0x1000, &[0x0F, 0x6E, 0xD0, 0x0F, 0x7E, 0xD3, 0xF4]);
    cpu.reg32[EAX] = 0x55AA_1234;
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.reg32[EBX], 0x55AA_1234);
}
